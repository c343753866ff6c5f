//! Campaigns stream: single linear pass with per-record fan-out
//!
//! Each campaign pulls its messages and tags in two bounded sub-requests,
//! joined into the record before emission.

use super::base::{fetch_all, linear_records, ms_to_datetime, REWIND_MS, SEED_EPOCH_MS};
use super::{RecordStream, Slice, SourceStream};
use crate::config::ConnectorConfig;
use crate::controller::Controller;
use crate::http::SharedClient;
use crate::types::SyncMode;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

const ENDPOINT: &str = "GET:/campaigns/";
const PATH: &str = "/campaigns/";
const MESSAGES_ENDPOINT: &str = "GET:/campaigns/{id}/campaign-messages/";
const TAGS_ENDPOINT: &str = "GET:/campaigns/{id}/tags/";

pub struct CampaignsStream {
    client: SharedClient,
    cursor: String,
}

impl CampaignsStream {
    pub fn new(config: &ConnectorConfig, client: SharedClient) -> Self {
        Self {
            client,
            cursor: if config.initialize {
                "created_at".to_string()
            } else {
                "updated_at".to_string()
            },
        }
    }
}

#[async_trait]
impl SourceStream for CampaignsStream {
    fn name(&self) -> &'static str {
        "campaigns"
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
    ) -> crate::error::Result<Option<i64>> {
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
                "created_at": {"type": "string", "format": "date-time"},
                "updated_at": {"type": "string", "format": "date-time"},
                "campaign_messages": {"type": "array"},
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

        Box::pin(try_stream! {
            let from = ms_to_datetime(cutoff.unwrap_or(SEED_EPOCH_MS - REWIND_MS));

            let campaigns = linear_records(
                client.clone(),
                ctl.clone(),
                ENDPOINT,
                PATH,
                Some((cursor.clone(), from)),
                Vec::new(),
            );
            futures::pin_mut!(campaigns);

            while let Some(campaign) = campaigns.next().await {
                let mut record = campaign?;
                let Some(id) = record.get("id").and_then(Value::as_str).map(String::from)
                else {
                    continue;
                };

                let messages_path = format!("/campaigns/{id}/campaign-messages/");
                let tags_path = format!("/campaigns/{id}/tags/");
                let (messages, tags) = tokio::join!(
                    fetch_all(&client, &ctl, MESSAGES_ENDPOINT, &messages_path),
                    fetch_all(&client, &ctl, TAGS_ENDPOINT, &tags_path),
                );

                if let Some(map) = record.as_object_mut() {
                    map.insert("campaign_messages".to_string(), Value::Array(messages?));
                    map.insert("tags".to_string(), Value::Array(tags?));
                }
                yield record;
            }
        })
    }
}
