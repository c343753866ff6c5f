//! Metrics stream: no cursor, full dump each run

use super::base::linear_records;
use super::{RecordStream, Slice, SourceStream};
use crate::controller::Controller;
use crate::http::SharedClient;
use crate::types::SyncMode;
use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

const ENDPOINT: &str = "GET:/metrics/";
const PATH: &str = "/metrics/";

pub struct MetricsStream {
    client: SharedClient,
}

impl MetricsStream {
    pub fn new(client: SharedClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceStream for MetricsStream {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn cursor_field(&self) -> Option<String> {
        None
    }

    fn checkpoint_interval(&self) -> u64 {
        0
    }

    fn json_schema(&self) -> Value {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": true,
            "properties": {
                "id": {"type": "string"},
                "name": {"type": ["string", "null"]},
                "integration": {"type": ["object", "null"]},
                "created": {"type": ["string", "null"]},
                "updated": {"type": ["string", "null"]}
            }
        })
    }

    fn read_records(
        &self,
        _sync_mode: SyncMode,
        _slice: Slice,
        _cutoff: Option<i64>,
        ctl: Controller,
    ) -> RecordStream {
        let client = self.client.clone();

        Box::pin(try_stream! {
            let metrics = linear_records(client, ctl, ENDPOINT, PATH, None, Vec::new());
            futures::pin_mut!(metrics);
            while let Some(metric) = metrics.next().await {
                yield metric?;
            }
        })
    }
}
