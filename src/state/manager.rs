//! State manager
//!
//! Holds per-stream watermarks for the run, parses either persisted format,
//! and renders checkpoint snapshots mirroring the input shape. Reads hand
//! out copies; a snapshot reflects every stream as of the moment it is
//! taken.

use super::types::{GlobalState, StateEnvelope, StreamCursor, StreamDescriptor, StreamStateEntry};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Wrapper key marking a compressed state payload
const GZ_KEY: &str = "_gz";

/// Which persisted format the input used; output mirrors it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFormat {
    Legacy,
    PerStream,
    Global,
}

/// Per-run state holder
#[derive(Debug, Clone)]
pub struct StateManager {
    format: StateFormat,
    cutoffs: BTreeMap<String, i64>,
    shared: Option<Value>,
    compress: bool,
}

impl StateManager {
    /// Create an empty legacy-format manager
    pub fn new(compress: bool) -> Self {
        Self {
            format: StateFormat::Legacy,
            cutoffs: BTreeMap::new(),
            shared: None,
            compress,
        }
    }

    /// Parse persisted state in either format, transparently decompressing
    pub fn parse(input: Option<&Value>, compress: bool) -> Result<Self> {
        let Some(input) = input else {
            return Ok(Self::new(compress));
        };
        let input = maybe_decompress(input)?;

        match &input {
            Value::Null => Ok(Self::new(compress)),
            Value::Object(map) => {
                let mut cutoffs = BTreeMap::new();
                for (stream, blob) in map {
                    if let Ok(cursor) = serde_json::from_value::<StreamCursor>(blob.clone()) {
                        cutoffs.insert(stream.clone(), cursor.cutoff);
                    }
                }
                Ok(Self {
                    format: StateFormat::Legacy,
                    cutoffs,
                    shared: None,
                    compress,
                })
            }
            Value::Array(items) => {
                let envelopes: Vec<StateEnvelope> =
                    serde_json::from_value(Value::Array(items.clone()))
                        .map_err(|e| Error::state(format!("invalid state envelope: {e}")))?;
                Self::from_envelopes(envelopes, compress)
            }
            other => Err(Error::state(format!(
                "unsupported state shape: {}",
                kind_of(other)
            ))),
        }
    }

    fn from_envelopes(envelopes: Vec<StateEnvelope>, compress: bool) -> Result<Self> {
        // A leading GLOBAL envelope selects the global format; otherwise the
        // sequence is per-stream entries.
        if let Some(StateEnvelope::Global { global }) = envelopes.first() {
            let mut cutoffs = BTreeMap::new();
            for entry in &global.stream_states {
                if let Some(cutoff) = entry.stream_state.get("cutoff").and_then(Value::as_i64) {
                    cutoffs.insert(entry.stream_descriptor.name.clone(), cutoff);
                }
            }
            return Ok(Self {
                format: StateFormat::Global,
                cutoffs,
                shared: global.shared_state.clone(),
                compress,
            });
        }

        let mut cutoffs = BTreeMap::new();
        for envelope in envelopes {
            if let StateEnvelope::Stream { stream } = envelope {
                if let Some(cutoff) = stream.stream_state.get("cutoff").and_then(Value::as_i64) {
                    cutoffs.insert(stream.stream_descriptor.name, cutoff);
                }
            }
        }
        Ok(Self {
            format: StateFormat::PerStream,
            cutoffs,
            shared: None,
            compress,
        })
    }

    /// The format snapshots are rendered in
    pub fn format(&self) -> StateFormat {
        self.format
    }

    /// Current watermark for a stream
    pub fn cutoff(&self, stream: &str) -> Option<i64> {
        self.cutoffs.get(stream).copied()
    }

    /// Advance a stream's watermark; never moves backwards
    pub fn advance(&mut self, stream: &str, cutoff: i64) {
        self.cutoffs
            .entry(stream.to_string())
            .and_modify(|current| *current = (*current).max(cutoff))
            .or_insert(cutoff);
    }

    /// Render a snapshot of every stream, mirroring the input format
    pub fn snapshot(&self) -> Value {
        let rendered = match self.format {
            StateFormat::Legacy => {
                let map: BTreeMap<&String, Value> = self
                    .cutoffs
                    .iter()
                    .map(|(name, cutoff)| (name, json!({"cutoff": cutoff})))
                    .collect();
                serde_json::to_value(map).expect("cutoff map is always serializable")
            }
            StateFormat::PerStream => {
                let envelopes: Vec<StateEnvelope> = self
                    .cutoffs
                    .iter()
                    .map(|(name, cutoff)| StateEnvelope::Stream {
                        stream: entry(name, *cutoff),
                    })
                    .collect();
                serde_json::to_value(envelopes).expect("envelopes are always serializable")
            }
            StateFormat::Global => {
                let envelope = StateEnvelope::Global {
                    global: GlobalState {
                        shared_state: self.shared.clone(),
                        stream_states: self
                            .cutoffs
                            .iter()
                            .map(|(name, cutoff)| entry(name, *cutoff))
                            .collect(),
                    },
                };
                serde_json::to_value(vec![envelope]).expect("envelopes are always serializable")
            }
        };

        if self.compress {
            compress_value(&rendered)
        } else {
            rendered
        }
    }
}

fn entry(name: &str, cutoff: i64) -> StreamStateEntry {
    StreamStateEntry {
        stream_descriptor: StreamDescriptor {
            name: name.to_string(),
        },
        stream_state: serde_json::to_value(StreamCursor { cutoff })
            .expect("cursor state is always serializable"),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Gzip + base64 a rendered state value into the wrapper object
fn compress_value(value: &Value) -> Value {
    let raw = serde_json::to_vec(value).expect("state is always serializable");
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .and_then(|()| encoder.finish())
        .map(|compressed| json!({ GZ_KEY: BASE64.encode(compressed) }))
        .expect("gzip of an in-memory buffer cannot fail")
}

/// Unwrap the compressed form when present
fn maybe_decompress(value: &Value) -> Result<Value> {
    let Some(encoded) = value.get(GZ_KEY).and_then(Value::as_str) else {
        return Ok(value.clone());
    };
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| Error::state(format!("invalid base64 in compressed state: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| Error::state(format!("invalid gzip in compressed state: {e}")))?;
    serde_json::from_slice(&raw).map_err(Error::from)
}

#[cfg(test)]
mod manager_tests {
    use super::*;

    #[test]
    fn test_empty_state() {
        let manager = StateManager::parse(None, false).unwrap();
        assert_eq!(manager.format(), StateFormat::Legacy);
        assert_eq!(manager.cutoff("events"), None);
        assert_eq!(manager.snapshot(), json!({}));
    }

    #[test]
    fn test_legacy_round_trip() {
        let input = json!({
            "events": {"cutoff": 1_714_557_600_000_i64},
            "profiles": {"cutoff": 1_700_000_000_000_i64}
        });
        let mut manager = StateManager::parse(Some(&input), false).unwrap();

        assert_eq!(manager.format(), StateFormat::Legacy);
        assert_eq!(manager.cutoff("events"), Some(1_714_557_600_000));

        manager.advance("events", 1_714_561_200_000);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot["events"]["cutoff"], 1_714_561_200_000_i64);
        assert_eq!(snapshot["profiles"]["cutoff"], 1_700_000_000_000_i64);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut manager = StateManager::new(false);
        manager.advance("events", 2000);
        manager.advance("events", 1000);
        assert_eq!(manager.cutoff("events"), Some(2000));
    }

    #[test]
    fn test_per_stream_envelopes_mirrored() {
        let input = json!([
            {
                "type": "STREAM",
                "stream": {
                    "stream_descriptor": {"name": "flows"},
                    "stream_state": {"cutoff": 5000}
                }
            }
        ]);
        let mut manager = StateManager::parse(Some(&input), false).unwrap();
        assert_eq!(manager.format(), StateFormat::PerStream);
        assert_eq!(manager.cutoff("flows"), Some(5000));

        manager.advance("flows", 6000);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0]["type"], "STREAM");
        assert_eq!(snapshot[0]["stream"]["stream_state"]["cutoff"], 6000);
    }

    #[test]
    fn test_global_envelope_mirrored() {
        let input = json!([
            {
                "type": "GLOBAL",
                "global": {
                    "shared_state": {"budget": 1},
                    "stream_states": [
                        {
                            "stream_descriptor": {"name": "events"},
                            "stream_state": {"cutoff": 7000}
                        }
                    ]
                }
            }
        ]);
        let manager = StateManager::parse(Some(&input), false).unwrap();
        assert_eq!(manager.format(), StateFormat::Global);
        assert_eq!(manager.cutoff("events"), Some(7000));

        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0]["type"], "GLOBAL");
        assert_eq!(snapshot[0]["global"]["shared_state"]["budget"], 1);
        assert_eq!(
            snapshot[0]["global"]["stream_states"][0]["stream_state"]["cutoff"],
            7000
        );
    }

    #[test]
    fn test_compression_round_trip() {
        let mut manager = StateManager::new(true);
        manager.advance("events", 1234);

        let snapshot = manager.snapshot();
        assert!(snapshot.get(GZ_KEY).is_some());

        let reparsed = StateManager::parse(Some(&snapshot), true).unwrap();
        assert_eq!(reparsed.cutoff("events"), Some(1234));
    }

    #[test]
    fn test_uncompressed_when_disabled() {
        let mut manager = StateManager::new(false);
        manager.advance("events", 1234);
        let snapshot = manager.snapshot();
        assert!(snapshot.get(GZ_KEY).is_none());
        assert_eq!(snapshot["events"]["cutoff"], 1234);
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let mut manager = StateManager::new(false);
        manager.advance("events", 1000);

        let before = manager.snapshot();
        manager.advance("events", 2000);

        // the earlier snapshot is unaffected by later writes
        assert_eq!(before["events"]["cutoff"], 1000);
        assert_eq!(manager.snapshot()["events"]["cutoff"], 2000);
    }

    #[test]
    fn test_invalid_shape_rejected() {
        let err = StateManager::parse(Some(&json!("nope")), false).unwrap_err();
        assert!(err.to_string().contains("unsupported state shape"));
    }
}
