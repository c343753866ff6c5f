//! Protocol messages emitted on stdout
//!
//! Every message is a single line of JSON. RECORD, STATE, STATUS and LOG are
//! the only shapes the downstream consumer sees; anything else goes to the
//! tracing subscriber on stderr.

use crate::types::LogLevel;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message emitted during a sync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "RECORD")]
    Record { record: RecordPayload },

    #[serde(rename = "STATE")]
    State { state: StatePayload },

    #[serde(rename = "SOURCE_STATUS")]
    Status(StatusPayload),

    #[serde(rename = "LOG")]
    Log { log: LogPayload },
}

/// Payload of a RECORD message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordPayload {
    /// Stream name
    pub stream: String,
    /// Record data
    pub data: Value,
    /// Epoch milliseconds at emission
    pub emitted_at: i64,
}

/// Payload of a STATE message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePayload {
    /// Serialized state map (possibly compressed)
    pub data: Value,
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Running,
    Success,
    Errored,
}

/// Payload of a SOURCE_STATUS message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: Status,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<StatusDetail>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamStatus>,
}

/// Human + machine detail attached to a status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDetail {
    pub summary: String,
    pub code: String,
    pub action: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl StatusDetail {
    /// A generic error detail with a placeholder machine code
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            code: "UNKNOWN".to_string(),
            action: "CHECK_LOGS".to_string(),
            kind: "ERROR".to_string(),
        }
    }
}

/// Per-stream status attached to a SOURCE_STATUS message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub name: String,
    pub status: Status,
    #[serde(rename = "recordsEmitted", skip_serializing_if = "Option::is_none")]
    pub records_emitted: Option<u64>,
}

/// Payload of a LOG message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl Message {
    /// Create a record message stamped with the current time
    pub fn record(stream: impl Into<String>, data: Value) -> Self {
        Self::Record {
            record: RecordPayload {
                stream: stream.into(),
                data,
                emitted_at: Utc::now().timestamp_millis(),
            },
        }
    }

    /// Create a state message
    pub fn state(data: Value) -> Self {
        Self::State {
            state: StatePayload { data },
        }
    }

    /// Status: a stream started
    pub fn stream_running(name: impl Into<String>) -> Self {
        Self::Status(StatusPayload {
            status: Status::Running,
            message: None,
            stream: Some(StreamStatus {
                name: name.into(),
                status: Status::Running,
                records_emitted: None,
            }),
        })
    }

    /// Status: a stream completed with a record count
    pub fn stream_success(name: impl Into<String>, records_emitted: u64) -> Self {
        Self::Status(StatusPayload {
            status: Status::Running,
            message: None,
            stream: Some(StreamStatus {
                name: name.into(),
                status: Status::Success,
                records_emitted: Some(records_emitted),
            }),
        })
    }

    /// Status: a stream failed
    pub fn stream_errored(
        name: impl Into<String>,
        records_emitted: u64,
        summary: impl Into<String>,
    ) -> Self {
        Self::Status(StatusPayload {
            status: Status::Errored,
            message: Some(StatusDetail::error(summary)),
            stream: Some(StreamStatus {
                name: name.into(),
                status: Status::Errored,
                records_emitted: Some(records_emitted),
            }),
        })
    }

    /// Status: a non-fatal advisory error, run keeps going
    pub fn advisory(name: impl Into<String>, summary: impl Into<String>) -> Self {
        Self::Status(StatusPayload {
            status: Status::Running,
            message: Some(StatusDetail::error(summary)),
            stream: Some(StreamStatus {
                name: name.into(),
                status: Status::Running,
                records_emitted: None,
            }),
        })
    }

    /// Status: the run failed
    pub fn run_errored(summary: impl Into<String>) -> Self {
        Self::Status(StatusPayload {
            status: Status::Errored,
            message: Some(StatusDetail::error(summary)),
            stream: None,
        })
    }

    /// Create a log message
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            log: LogPayload {
                level,
                message: message.into(),
                stack_trace: None,
            },
        }
    }

    /// Serialize to a single NDJSON line (no trailing newline)
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).expect("protocol messages are always serializable")
    }
}
