//! Events stream: highest volume, hourly shards, 20-way parallel

use super::base::{ms_to_datetime, peek_earliest, shard_records};
use super::{RecordStream, Slice, SourceStream};
use crate::config::ConnectorConfig;
use crate::controller::Controller;
use crate::http::SharedClient;
use crate::orchestrator::{DedupKeys, Orchestrator};
use crate::shard;
use crate::types::SyncMode;
use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::StreamExt;
use serde_json::{json, Value};

const ENDPOINT: &str = "GET:/events/";
const PATH: &str = "/events/";
const PAGE_SIZE: u32 = 200;
const PARALLEL: usize = 20;

pub struct EventsStream {
    client: SharedClient,
    cursor: String,
}

impl EventsStream {
    pub fn new(config: &ConnectorConfig, client: SharedClient) -> Self {
        Self {
            client,
            // the cursor-field policy is configurable; `datetime` is the
            // server-sortable default
            cursor: config
                .events_cursor
                .clone()
                .unwrap_or_else(|| "datetime".to_string()),
        }
    }
}

#[async_trait]
impl SourceStream for EventsStream {
    fn name(&self) -> &'static str {
        "events"
    }

    fn cursor_field(&self) -> Option<String> {
        Some(self.cursor.clone())
    }

    fn checkpoint_interval(&self) -> u64 {
        100_000
    }

    async fn starting_cutoff(
        &self,
        _sync_mode: SyncMode,
        cutoff: Option<i64>,
        ctl: &Controller,
    ) -> crate::error::Result<Option<i64>> {
        if cutoff.is_some() {
            return Ok(cutoff);
        }
        // seed from the earliest record; an empty account starts at now
        let seeded = peek_earliest(&self.client, ctl, ENDPOINT, PATH, &self.cursor)
            .await?
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        Ok(Some(seeded))
    }

    fn json_schema(&self) -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": true,
            "properties": {
                "id": {"type": "string"},
                "datetime": {"type": "string", "format": "date-time"},
                "timestamp": {"type": ["integer", "null"]},
                "uuid": {"type": ["string", "null"]},
                "event_properties": {"type": ["object", "null"]}
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
            let from_ms = cutoff.unwrap_or_else(|| Utc::now().timestamp_millis());

            let shards = shard::plan(
                ms_to_datetime(from_ms),
                None,
                Duration::hours(1),
                Duration::seconds(5),
                Some(Duration::minutes(1)),
            );
            if shards.is_empty() {
                return;
            }

            let spool_dir = tempfile::tempdir()?;
            let orchestrator = Orchestrator {
                parallel: PARALLEL,
                dedup: Some(DedupKeys {
                    primary_key: "id".to_string(),
                    cursor_field: cursor.clone(),
                }),
            };

            let producer = {
                let client = client.clone();
                let ctl = ctl.clone();
                let cursor = cursor.clone();
                move |shard: shard::Shard| {
                    shard_records(
                        client.clone(),
                        ctl.clone(),
                        ENDPOINT,
                        PATH,
                        cursor.clone(),
                        PAGE_SIZE,
                        shard,
                    )
                }
            };

            let merged = orchestrator.run(
                spool_dir.path().to_path_buf(),
                shards,
                ctl.clone(),
                producer,
            );
            futures::pin_mut!(merged);
            while let Some(record) = merged.next().await {
                yield record?;
            }
            // spool_dir dropped here, removing the run's temp directory
            drop(spool_dir);
        })
    }
}
