//! Shared read plumbing for the concrete streams

use crate::controller::Controller;
use crate::error::Result;
use crate::http::{Filter, SharedClient};
use crate::pagination::{self, PageChunk};
use crate::shard::Shard;
use crate::types::value_to_epoch_ms;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::{Map, Value};
use url::Url;

/// Watermark seed for streams without an earliest-record peek
pub const SEED_EPOCH_MS: i64 = 946_684_800_000; // 2000-01-01T00:00:00Z

/// Resume rewind absorbing server clock skew
pub const REWIND_MS: i64 = 3_600_000;

/// Flatten a JSON:API resource into a plain record: `id` plus the
/// `attributes` object hoisted to the top level.
pub fn normalize(item: &Value) -> Value {
    let mut out = Map::new();
    if let Some(id) = item.get("id") {
        out.insert("id".to_string(), id.clone());
    }
    if let Some(Value::Object(attributes)) = item.get("attributes") {
        for (key, value) in attributes {
            out.insert(key.clone(), value.clone());
        }
    }
    Value::Object(out)
}

/// Epoch ms of a datetime, clamped into chrono's representable range
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// First-page peek sorted ascending by `sort_field`; returns the earliest
/// record's cursor value in epoch ms.
pub async fn peek_earliest(
    client: &SharedClient,
    ctl: &Controller,
    endpoint_key: &'static str,
    path: &str,
    sort_field: &str,
) -> Result<Option<i64>> {
    let url = client.endpoint_url(
        path,
        &[
            ("sort".to_string(), sort_field.to_string()),
            ("page[size]".to_string(), "1".to_string()),
        ],
    )?;
    let page = client.fetch_page(ctl, endpoint_key, url).await?;
    Ok(page
        .data
        .first()
        .map(normalize)
        .as_ref()
        .and_then(|record| record.get(sort_field))
        .and_then(value_to_epoch_ms))
}

/// Paginated, normalized records of one time shard, filtered and sorted on
/// the cursor field server-side.
pub fn shard_records(
    client: SharedClient,
    ctl: Controller,
    endpoint_key: &'static str,
    path: &'static str,
    cursor_field: String,
    page_size: u32,
    shard: Shard,
) -> impl Stream<Item = Result<Value>> + Send + 'static {
    pagination::records(move |next: Option<Url>| {
        let client = client.clone();
        let ctl = ctl.clone();
        let cursor_field = cursor_field.clone();
        let shard = shard.clone();
        async move {
            let url = match next {
                Some(url) => url,
                None => {
                    let filter = Filter::new()
                        .greater_or_equal(&cursor_field, shard.from)
                        .less_than(&cursor_field, shard.to);
                    client.endpoint_url(
                        path,
                        &[
                            ("filter".to_string(), filter.build()),
                            ("sort".to_string(), cursor_field.clone()),
                            ("page[size]".to_string(), page_size.to_string()),
                        ],
                    )?
                }
            };
            let page = client.fetch_page(&ctl, endpoint_key, url).await?;
            Ok(PageChunk {
                data: page.data.iter().map(normalize).collect(),
                next: page.next,
            })
        }
    })
}

/// Paginated, normalized records of a linear (un-sharded) stream, optionally
/// filtered on the cursor field from `from` onwards.
pub fn linear_records(
    client: SharedClient,
    ctl: Controller,
    endpoint_key: &'static str,
    path: &'static str,
    cursor_filter: Option<(String, DateTime<Utc>)>,
    extra_query: Vec<(String, String)>,
) -> impl Stream<Item = Result<Value>> + Send + 'static {
    pagination::records(move |next: Option<Url>| {
        let client = client.clone();
        let ctl = ctl.clone();
        let cursor_filter = cursor_filter.clone();
        let extra_query = extra_query.clone();
        async move {
            let url = match next {
                Some(url) => url,
                None => {
                    let mut query = extra_query;
                    if let Some((field, from)) = &cursor_filter {
                        let filter = Filter::new().greater_or_equal(field, *from);
                        query.push(("filter".to_string(), filter.build()));
                        query.push(("sort".to_string(), field.clone()));
                    }
                    client.endpoint_url(path, &query)?
                }
            };
            let page = client.fetch_page(&ctl, endpoint_key, url).await?;
            Ok(PageChunk {
                data: page.data.iter().map(normalize).collect(),
                next: page.next,
            })
        }
    })
}

/// Fetch every page of a sub-resource and return the normalized records
pub async fn fetch_all(
    client: &SharedClient,
    ctl: &Controller,
    endpoint_key: &'static str,
    path: &str,
) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    let mut url = Some(client.endpoint_url(path, &[])?);
    while let Some(current) = url.take() {
        let page = client.fetch_page(ctl, endpoint_key, current).await?;
        out.extend(page.data.iter().map(normalize));
        url = page.next;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_hoists_attributes() {
        let item = json!({
            "type": "event",
            "id": "e1",
            "attributes": {"datetime": "2024-05-01T10:00:00Z", "uuid": "u1"},
            "relationships": {"profile": {"data": {"id": "p1"}}}
        });
        let record = normalize(&item);

        assert_eq!(record["id"], "e1");
        assert_eq!(record["datetime"], "2024-05-01T10:00:00Z");
        assert_eq!(record["uuid"], "u1");
        assert!(record.get("attributes").is_none());
        assert!(record.get("relationships").is_none());
    }

    #[test]
    fn test_normalize_tolerates_bare_objects() {
        let record = normalize(&json!({"id": "x"}));
        assert_eq!(record, json!({"id": "x"}));

        let record = normalize(&json!({"attributes": {"name": "n"}}));
        assert_eq!(record, json!({"name": "n"}));
    }

    #[test]
    fn test_ms_to_datetime_round_trip() {
        let dt = ms_to_datetime(1_714_557_600_000);
        assert_eq!(dt.timestamp_millis(), 1_714_557_600_000);
    }
}
