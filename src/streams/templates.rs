//! Templates stream: linear pass with a 1-hour watermark rewind on resume

use super::base::{linear_records, ms_to_datetime, REWIND_MS, SEED_EPOCH_MS};
use super::{RecordStream, Slice, SourceStream};
use crate::config::ConnectorConfig;
use crate::controller::Controller;
use crate::http::SharedClient;
use crate::types::SyncMode;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

const ENDPOINT: &str = "GET:/templates/";
const PATH: &str = "/templates/";

pub struct TemplatesStream {
    client: SharedClient,
    cursor: String,
}

impl TemplatesStream {
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
}

#[async_trait]
impl SourceStream for TemplatesStream {
    fn name(&self) -> &'static str {
        "templates"
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
        Ok(Some(cutoff.unwrap_or(SEED_EPOCH_MS)))
    }

    fn json_schema(&self) -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": true,
            "properties": {
                "id": {"type": "string"},
                "name": {"type": ["string", "null"]},
                "editor_type": {"type": ["string", "null"]},
                "html": {"type": ["string", "null"]},
                "created": {"type": "string", "format": "date-time"},
                "updated": {"type": "string", "format": "date-time"}
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
            // rewind tolerates server clock skew across resumes
            let from = ms_to_datetime(cutoff.unwrap_or(SEED_EPOCH_MS) - REWIND_MS);

            let templates = linear_records(
                client,
                ctl,
                ENDPOINT,
                PATH,
                Some((cursor.clone(), from)),
                Vec::new(),
            );
            futures::pin_mut!(templates);
            while let Some(template) = templates.next().await {
                yield template?;
            }
        })
    }
}
