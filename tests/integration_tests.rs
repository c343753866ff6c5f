//! End-to-end tests against a mock Klaviyo API

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use klaviyo_source::config::{
    CatalogEntry, ConfiguredCatalog, ConfiguredStream, ConnectorConfig,
};
use klaviyo_source::controller::Controller;
use klaviyo_source::driver::SyncDriver;
use klaviyo_source::http::{KlaviyoClient, RetryPolicy};
use klaviyo_source::messages::{Message, Status};
use klaviyo_source::streams::build_streams;
use klaviyo_source::types::SyncMode;
use klaviyo_source::Error;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

// ============================================================================
// Helpers
// ============================================================================

fn test_config() -> ConnectorConfig {
    ConnectorConfig::from_value(json!({
        "credentials": {"auth_type": "api_key", "api_key": "pk_test"},
        "compress_state": false
    }))
    .unwrap()
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial: Duration::from_millis(1),
        factor: 2,
        cap: Duration::from_millis(20),
        max_attempts: 5,
    }
}

fn client_for(server: &MockServer) -> Arc<KlaviyoClient> {
    Arc::new(
        KlaviyoClient::new(&test_config())
            .unwrap()
            .with_base_url(format!("{}/api", server.uri()))
            .with_retry_policy(fast_retry()),
    )
}

fn catalog(names: &[(&str, &str, SyncMode)]) -> ConfiguredCatalog {
    ConfiguredCatalog {
        streams: names
            .iter()
            .map(|(name, cursor, mode)| ConfiguredStream {
                stream: CatalogEntry {
                    name: (*name).to_string(),
                    json_schema: json!({"type": "object"}),
                    supported_sync_modes: vec![SyncMode::FullRefresh, SyncMode::Incremental],
                    default_cursor_field: if cursor.is_empty() {
                        None
                    } else {
                        Some((*cursor).to_string())
                    },
                    source_defined_primary_key: Some(vec!["id".to_string()]),
                },
                sync_mode: *mode,
            })
            .collect(),
    }
}

async fn run_sync(
    server: &MockServer,
    catalog: ConfiguredCatalog,
    state: Option<Value>,
) -> (Vec<Message>, Option<Error>) {
    let config = test_config();
    let client = client_for(server);
    let streams = build_streams(&config, client);
    let driver = SyncDriver::new(config, streams);

    let mut out = Vec::new();
    let mut error = None;
    let mut messages = driver.read(catalog, state);
    while let Some(item) = messages.next().await {
        match item {
            Ok(m) => out.push(m),
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    (out, error)
}

fn record_ids(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            Message::Record { record } => {
                Some(record.data["id"].as_str().unwrap().to_string())
            }
            _ => None,
        })
        .collect()
}

fn last_state(messages: &[Message]) -> Option<Value> {
    messages.iter().rev().find_map(|m| match m {
        Message::State { state } => Some(state.data.clone()),
        _ => None,
    })
}

fn stream_status(messages: &[Message], name: &str, status: Status) -> Option<Option<u64>> {
    messages.iter().rev().find_map(|m| match m {
        Message::Status(s) => match &s.stream {
            Some(st) if st.name == name && st.status == status => Some(st.records_emitted),
            _ => None,
        },
        _ => None,
    })
}

fn iso(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .unwrap()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

/// Responds to a collection endpoint by filtering a fixed item list with the
/// request's `greater-or-equal`/`less-than` bounds on the cursor field, the
/// way the live API evaluates filter expressions.
struct FilteredResponder {
    kind: &'static str,
    field: &'static str,
    /// (epoch ms, id), ascending
    items: Vec<(i64, String)>,
}

impl FilteredResponder {
    fn new(kind: &'static str, field: &'static str, items: Vec<(i64, &str)>) -> Self {
        Self {
            kind,
            field,
            items: items
                .into_iter()
                .map(|(ms, id)| (ms, id.to_string()))
                .collect(),
        }
    }
}

impl Respond for FilteredResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let mut from = i64::MIN;
        let mut to = i64::MAX;
        let mut page_size = usize::MAX;

        for (key, value) in request.url.query_pairs() {
            match key.as_ref() {
                "filter" => {
                    let ge = format!("greater-or-equal({},", self.field);
                    let lt = format!("less-than({},", self.field);
                    if let Some(ts) = extract_bound(&value, &ge) {
                        from = ts;
                    }
                    if let Some(ts) = extract_bound(&value, &lt) {
                        to = ts;
                    }
                }
                "page[size]" => {
                    if let Ok(n) = value.parse() {
                        page_size = n;
                    }
                }
                _ => {}
            }
        }

        let data: Vec<Value> = self
            .items
            .iter()
            .filter(|(ms, _)| *ms >= from && *ms < to)
            .take(page_size)
            .map(|(ms, id)| {
                let mut attributes = Map::new();
                attributes.insert(self.field.to_string(), Value::String(iso(*ms)));
                json!({
                    "type": self.kind,
                    "id": id,
                    "attributes": attributes
                })
            })
            .collect();

        ResponseTemplate::new(200).set_body_json(json!({"data": data, "links": {}}))
    }
}

fn extract_bound(filter: &str, prefix: &str) -> Option<i64> {
    let start = filter.find(prefix)? + prefix.len();
    let end = filter[start..].find(')')? + start;
    DateTime::parse_from_rfc3339(&filter[start..end])
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn jsonapi_page(items: Vec<Value>) -> Value {
    json!({"data": items, "links": {}})
}

// ============================================================================
// Connection check
// ============================================================================

#[tokio::test]
async fn test_check_succeeds_with_valid_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/metrics/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.check(&Controller::new()).await.unwrap();
}

#[tokio::test]
async fn test_check_maps_auth_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/metrics/"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"detail": "Invalid API key"})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client.check(&Controller::new()).await.unwrap_err();
    assert!(matches!(err, Error::Auth { .. }));
    assert!(err.to_string().contains("401"));
}

// ============================================================================
// Events: empty stream, ordering, dedup, transient failures
// ============================================================================

#[tokio::test]
async fn test_empty_events_stream_checkpoints_seed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/"))
        .respond_with(FilteredResponder::new("event", "datetime", vec![]))
        .mount(&server)
        .await;

    let started = Utc::now().timestamp_millis();
    let (messages, error) = run_sync(
        &server,
        catalog(&[("events", "datetime", SyncMode::Incremental)]),
        None,
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    assert!(record_ids(&messages).is_empty());
    assert_eq!(
        stream_status(&messages, "events", Status::Success),
        Some(Some(0))
    );

    // the seeded watermark is checkpointed even with no records
    let state = last_state(&messages).unwrap();
    let cutoff = state["events"]["cutoff"].as_i64().unwrap();
    assert!(cutoff >= started);
}

#[tokio::test]
async fn test_events_emitted_in_cursor_order_with_final_cutoff() {
    let server = MockServer::start().await;
    let base = Utc::now() - ChronoDuration::hours(2);
    let base_ms = base.timestamp_millis();

    let e1 = base_ms + 30 * 60 * 1000;
    let e2 = base_ms + 35 * 60 * 1000;
    let e3 = base_ms + 90 * 60 * 1000;
    Mock::given(method("GET"))
        .and(path("/api/events/"))
        .respond_with(FilteredResponder::new(
            "event",
            "datetime",
            vec![(e1, "e1"), (e2, "e2"), (e3, "e3")],
        ))
        .mount(&server)
        .await;

    let state = json!({"events": {"cutoff": base_ms}});
    let (messages, error) = run_sync(
        &server,
        catalog(&[("events", "datetime", SyncMode::Incremental)]),
        Some(state),
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    assert_eq!(record_ids(&messages), vec!["e1", "e2", "e3"]);
    assert_eq!(
        stream_status(&messages, "events", Status::Success),
        Some(Some(3))
    );

    let state = last_state(&messages).unwrap();
    assert_eq!(state["events"]["cutoff"].as_i64().unwrap(), e3);
}

#[tokio::test]
async fn test_shard_boundary_duplicate_emitted_once() {
    let server = MockServer::start().await;
    let base = Utc::now() - ChronoDuration::hours(2);
    let base_ms = base.timestamp_millis();

    // lands in the first shard's tail and in the second shard's widened
    // start; the overlap makes the API return it twice
    let boundary = base_ms + 60 * 60 * 1000 - 2_000;
    Mock::given(method("GET"))
        .and(path("/api/events/"))
        .respond_with(FilteredResponder::new(
            "event",
            "datetime",
            vec![(boundary, "dup"), (base_ms + 90 * 60 * 1000, "later")],
        ))
        .mount(&server)
        .await;

    let state = json!({"events": {"cutoff": base_ms}});
    let (messages, error) = run_sync(
        &server,
        catalog(&[("events", "datetime", SyncMode::Incremental)]),
        Some(state),
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(record_ids(&messages), vec!["dup", "later"]);
}

#[tokio::test]
async fn test_transient_failures_are_retried_without_duplicates() {
    let server = MockServer::start().await;
    let base = Utc::now() - ChronoDuration::hours(1);
    let base_ms = base.timestamp_millis();

    // first two hits fail with 500, then the endpoint recovers
    Mock::given(method("GET"))
        .and(path("/api/events/"))
        .respond_with(ResponseTemplate::new(500).set_body_string("transient"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/events/"))
        .respond_with(FilteredResponder::new(
            "event",
            "datetime",
            vec![
                (base_ms + 10 * 60 * 1000, "e1"),
                (base_ms + 20 * 60 * 1000, "e2"),
            ],
        ))
        .mount(&server)
        .await;

    let state = json!({"events": {"cutoff": base_ms}});
    let (messages, error) = run_sync(
        &server,
        catalog(&[("events", "datetime", SyncMode::Incremental)]),
        Some(state),
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");
    assert_eq!(record_ids(&messages), vec!["e1", "e2"]);

    // exactly one final state for the stream, no duplicates from retries
    let states = messages
        .iter()
        .filter(|m| matches!(m, Message::State { .. }))
        .count();
    assert_eq!(states, 1);
}

#[tokio::test]
async fn test_client_fault_fails_the_stream() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events/"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"detail": "bad filter"})),
        )
        .mount(&server)
        .await;

    let (messages, error) = run_sync(
        &server,
        catalog(&[("events", "datetime", SyncMode::Incremental)]),
        // half an hour back: exactly one shard, so exactly one request
        Some(json!({"events": {"cutoff": Utc::now().timestamp_millis() - 1_800_000}})),
    )
    .await;

    assert!(matches!(error, Some(Error::HttpStatus { status: 400, .. })));
    assert!(stream_status(&messages, "events", Status::Errored).is_some());
    // one request, no retries on client faults
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

// ============================================================================
// Campaigns: linear pass with fan-out
// ============================================================================

#[tokio::test]
async fn test_campaigns_join_messages_and_tags() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/campaigns/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![json!({
            "type": "campaign",
            "id": "c1",
            "attributes": {"name": "Spring", "updated_at": "2024-05-01T10:00:00Z"}
        })])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/campaigns/c1/campaign-messages/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![json!({
            "type": "campaign-message",
            "id": "m1",
            "attributes": {"channel": "email"}
        })])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/campaigns/c1/tags/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![json!({
            "type": "tag",
            "id": "t1",
            "attributes": {"name": "newsletter"}
        })])))
        .mount(&server)
        .await;

    let (messages, error) = run_sync(
        &server,
        catalog(&[("campaigns", "updated_at", SyncMode::Incremental)]),
        None,
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    let record = messages
        .iter()
        .find_map(|m| match m {
            Message::Record { record } => Some(record.data.clone()),
            _ => None,
        })
        .unwrap();

    assert_eq!(record["id"], "c1");
    assert_eq!(record["campaign_messages"][0]["id"], "m1");
    assert_eq!(record["campaign_messages"][0]["channel"], "email");
    assert_eq!(record["tags"][0]["name"], "newsletter");

    let state = last_state(&messages).unwrap();
    assert_eq!(
        state["campaigns"]["cutoff"].as_i64().unwrap(),
        1_714_557_600_000
    );
}

#[tokio::test]
async fn test_campaigns_resume_does_not_replay_acknowledged_records() {
    let server = MockServer::start().await;
    let cutoff_ms: i64 = 1_714_557_600_000;
    // inside the hour before the watermark: a filter rewind would re-fetch it
    let old_ms = cutoff_ms - 30 * 60 * 1000;
    let new_ms = cutoff_ms + 10 * 60 * 1000;

    Mock::given(method("GET"))
        .and(path("/api/campaigns/"))
        .respond_with(FilteredResponder::new(
            "campaign",
            "updated_at",
            vec![(old_ms, "c-old"), (new_ms, "c-new")],
        ))
        .mount(&server)
        .await;
    for id in ["c-old", "c-new"] {
        Mock::given(method("GET"))
            .and(path(format!("/api/campaigns/{id}/campaign-messages/")))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/campaigns/{id}/tags/")))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![])))
            .mount(&server)
            .await;
    }

    let state = json!({"campaigns": {"cutoff": cutoff_ms}});
    let (messages, error) = run_sync(
        &server,
        catalog(&[("campaigns", "updated_at", SyncMode::Incremental)]),
        Some(state),
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    // only the record past the watermark is emitted again
    assert_eq!(record_ids(&messages), vec!["c-new"]);
    let state = last_state(&messages).unwrap();
    assert_eq!(state["campaigns"]["cutoff"].as_i64().unwrap(), new_ms);
}

// ============================================================================
// Flows: nested composition
// ============================================================================

#[tokio::test]
async fn test_flows_compose_actions_messages_and_template() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/flows/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![json!({
            "type": "flow",
            "id": "f1",
            "attributes": {"name": "Welcome", "updated": "2024-05-01T09:00:00Z"}
        })])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/flows/f1/flow-actions/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![json!({
            "type": "flow-action",
            "id": "a1",
            "attributes": {"action_type": "SEND_EMAIL"}
        })])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/flows/f1/tags/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![json!({
            "type": "tag",
            "id": "t9",
            "attributes": {"name": "onboarding"}
        })])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/flow-actions/a1/flow-messages/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![json!({
            "type": "flow-message",
            "id": "m1",
            "attributes": {"name": "Welcome email"}
        })])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/flow-messages/m1/relationships/template/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"type": "template", "id": "tpl-42"}
        })))
        .mount(&server)
        .await;

    let (messages, error) = run_sync(
        &server,
        catalog(&[("flows", "updated", SyncMode::Incremental)]),
        None,
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    let record = messages
        .iter()
        .find_map(|m| match m {
            Message::Record { record } => Some(record.data.clone()),
            _ => None,
        })
        .unwrap();

    assert_eq!(record["id"], "f1");
    assert_eq!(record["tags"][0]["name"], "onboarding");
    let action = &record["flow_actions"][0];
    assert_eq!(action["id"], "a1");
    let message = &action["flow_messages"][0];
    assert_eq!(message["id"], "m1");
    assert_eq!(message["template_id"], "tpl-42");
}

#[tokio::test]
async fn test_flows_resume_does_not_replay_acknowledged_records() {
    let server = MockServer::start().await;
    let cutoff_ms: i64 = 1_714_557_600_000;
    let old_ms = cutoff_ms - 30 * 60 * 1000;
    let new_ms = cutoff_ms + 10 * 60 * 1000;

    Mock::given(method("GET"))
        .and(path("/api/flows/"))
        .respond_with(FilteredResponder::new(
            "flow",
            "updated",
            vec![(old_ms, "f-old"), (new_ms, "f-new")],
        ))
        .mount(&server)
        .await;
    for id in ["f-old", "f-new"] {
        Mock::given(method("GET"))
            .and(path(format!("/api/flows/{id}/flow-actions/")))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/api/flows/{id}/tags/")))
            .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![])))
            .mount(&server)
            .await;
    }

    let state = json!({"flows": {"cutoff": cutoff_ms}});
    let (messages, error) = run_sync(
        &server,
        catalog(&[("flows", "updated", SyncMode::Incremental)]),
        Some(state),
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    assert_eq!(record_ids(&messages), vec!["f-new"]);
    let state = last_state(&messages).unwrap();
    assert_eq!(state["flows"]["cutoff"].as_i64().unwrap(), new_ms);
}

// ============================================================================
// Metrics: full dump
// ============================================================================

#[tokio::test]
async fn test_metrics_full_dump_without_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/metrics/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jsonapi_page(vec![
            json!({"type": "metric", "id": "m1", "attributes": {"name": "Placed Order"}}),
            json!({"type": "metric", "id": "m2", "attributes": {"name": "Opened Email"}}),
        ])))
        .mount(&server)
        .await;

    let (messages, error) = run_sync(
        &server,
        catalog(&[("metrics", "", SyncMode::FullRefresh)]),
        None,
    )
    .await;
    assert!(error.is_none(), "unexpected error: {error:?}");

    assert_eq!(record_ids(&messages), vec!["m1", "m2"]);
    // no cursor field: the state map never mentions the stream
    let state = last_state(&messages).unwrap();
    assert!(state.get("metrics").is_none());
}
