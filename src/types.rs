//! Common types shared across modules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sync mode for a configured stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Read everything, ignore the cursor
    FullRefresh,
    /// Read records past the persisted watermark
    Incremental,
}

/// Log level for protocol LOG messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Epoch milliseconds of a datetime
pub fn epoch_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Parse a JSON field value into epoch milliseconds.
///
/// Accepts RFC 3339 strings (with or without offset) and numeric epoch
/// values; numbers below 10^12 are treated as seconds.
pub fn value_to_epoch_ms(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            // Some endpoints return naive timestamps
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Some(naive.and_utc().timestamp_millis());
            }
            None
        }
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            if raw.abs() < 1_000_000_000_000 {
                Some(raw * 1000)
            } else {
                Some(raw)
            }
        }
        _ => None,
    }
}

/// Extract a field from a record as a string (primary-key comparison form)
pub fn value_to_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
