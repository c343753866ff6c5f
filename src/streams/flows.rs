//! Flows stream: linear pass with nested fan-out
//!
//! For each flow: flow-actions and tags; for each action: its messages; for
//! each message: the template relationship. Every sub-request goes through
//! the rate limiter.

use super::base::{fetch_all, linear_records, ms_to_datetime, REWIND_MS, SEED_EPOCH_MS};
use super::{RecordStream, Slice, SourceStream};
use crate::config::ConnectorConfig;
use crate::controller::Controller;
use crate::error::Result;
use crate::http::SharedClient;
use crate::types::SyncMode;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

const ENDPOINT: &str = "GET:/flows/";
const PATH: &str = "/flows/";
const ACTIONS_ENDPOINT: &str = "GET:/flows/{id}/flow-actions/";
const TAGS_ENDPOINT: &str = "GET:/flows/{id}/tags/";
const MESSAGES_ENDPOINT: &str = "GET:/flow-actions/{id}/flow-messages/";
const TEMPLATE_ENDPOINT: &str = "GET:/flow-messages/{id}/relationships/template/";

pub struct FlowsStream {
    client: SharedClient,
    cursor: String,
}

impl FlowsStream {
    pub fn new(config: &ConnectorConfig, client: SharedClient) -> Self {
        Self {
            client,
            cursor: if config.initialize {
                "created".to_string()
            } else {
                "updated".to_string()
            },
        }
    }

    /// Actions with their messages, each message carrying its template id
    async fn compose_actions(&self, ctl: &Controller, flow_id: &str) -> Result<Vec<Value>> {
        let actions_path = format!("/flows/{flow_id}/flow-actions/");
        let mut actions = fetch_all(&self.client, ctl, ACTIONS_ENDPOINT, &actions_path).await?;

        for action in &mut actions {
            let Some(action_id) = action.get("id").and_then(Value::as_str).map(String::from)
            else {
                continue;
            };

            let messages_path = format!("/flow-actions/{action_id}/flow-messages/");
            let mut messages =
                fetch_all(&self.client, ctl, MESSAGES_ENDPOINT, &messages_path).await?;

            for message in &mut messages {
                let Some(message_id) =
                    message.get("id").and_then(Value::as_str).map(String::from)
                else {
                    continue;
                };
                let template_path = format!("/flow-messages/{message_id}/relationships/template/");
                let template = self
                    .client
                    .get(ctl, TEMPLATE_ENDPOINT, &template_path, &[])
                    .await?;
                let template_id = template.pointer("/data/id").cloned().unwrap_or(Value::Null);
                if let Some(map) = message.as_object_mut() {
                    map.insert("template_id".to_string(), template_id);
                }
            }

            if let Some(map) = action.as_object_mut() {
                map.insert("flow_messages".to_string(), Value::Array(messages));
            }
        }
        Ok(actions)
    }
}

#[async_trait]
impl SourceStream for FlowsStream {
    fn name(&self) -> &'static str {
        "flows"
    }

    fn cursor_field(&self) -> Option<String> {
        Some(self.cursor.clone())
    }

    fn checkpoint_interval(&self) -> u64 {
        0
    }

    async fn starting_cutoff(
        &self,
        _sync_mode: SyncMode,
        cutoff: Option<i64>,
        _ctl: &Controller,
    ) -> Result<Option<i64>> {
        if cutoff.is_some() {
            return Ok(cutoff);
        }
        // first run starts one hour before the epoch
        Ok(Some(SEED_EPOCH_MS - REWIND_MS))
    }

    fn json_schema(&self) -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": true,
            "properties": {
                "id": {"type": "string"},
                "name": {"type": ["string", "null"]},
                "status": {"type": ["string", "null"]},
                "created": {"type": "string", "format": "date-time"},
                "updated": {"type": "string", "format": "date-time"},
                "flow_actions": {"type": "array"},
                "tags": {"type": "array"}
            }
        })
    }

    fn read_records(
        &self,
        _sync_mode: SyncMode,
        _slice: Slice,
        cutoff: Option<i64>,
        ctl: Controller,
    ) -> RecordStream {
        let client = self.client.clone();
        let cursor = self.cursor.clone();
        let this = FlowsStream {
            client: client.clone(),
            cursor: cursor.clone(),
        };

        Box::pin(try_stream! {
            let from = ms_to_datetime(cutoff.unwrap_or(SEED_EPOCH_MS - REWIND_MS));

            let flows = linear_records(
                client.clone(),
                ctl.clone(),
                ENDPOINT,
                PATH,
                Some((cursor.clone(), from)),
                Vec::new(),
            );
            futures::pin_mut!(flows);

            while let Some(flow) = flows.next().await {
                let mut record = flow?;
                let Some(id) = record.get("id").and_then(Value::as_str).map(String::from)
                else {
                    continue;
                };

                let tags_path = format!("/flows/{id}/tags/");
                let (actions, tags) = tokio::join!(
                    this.compose_actions(&ctl, &id),
                    fetch_all(&client, &ctl, TAGS_ENDPOINT, &tags_path),
                );

                if let Some(map) = record.as_object_mut() {
                    map.insert("flow_actions".to_string(), Value::Array(actions?));
                    map.insert("tags".to_string(), Value::Array(tags?));
                }
                yield record;
            }
        })
    }
}
