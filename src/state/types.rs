//! Persisted state shapes
//!
//! Two formats are accepted on input and mirrored on output: the legacy map
//! `{stream -> {cutoff}}`, and a sequence of per-stream or global envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Watermark for one stream: epoch milliseconds of the newest emitted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCursor {
    pub cutoff: i64,
}

/// A stream identified by name only (namespace deferred)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub name: String,
}

/// Per-stream state entry inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStateEntry {
    pub stream_descriptor: StreamDescriptor,
    pub stream_state: Value,
}

/// Shared state plus per-stream states
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_state: Option<Value>,
    pub stream_states: Vec<StreamStateEntry>,
}

/// One element of an envelope-format state sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StateEnvelope {
    #[serde(rename = "STREAM")]
    Stream { stream: StreamStateEntry },
    #[serde(rename = "GLOBAL")]
    Global { global: GlobalState },
}
