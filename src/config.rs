//! Connector configuration and catalog types

use crate::error::{Error, Result};
use crate::types::SyncMode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Connector configuration, parsed from the `--config` file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectorConfig {
    /// Authentication credentials
    pub credentials: Credentials,

    /// Sort and filter streams by creation time instead of update time
    #[serde(default)]
    pub initialize: bool,

    /// Ignore input state and suppress checkpoint messages
    #[serde(default)]
    pub backfill: bool,

    /// Stream-level failure budget (-1 = unlimited, absent = fail fast)
    #[serde(default)]
    pub max_stream_failures: Option<i64>,

    /// Slice-level failure budget per stream (-1 = unlimited, absent = fail fast)
    #[serde(default)]
    pub max_slice_failures: Option<i64>,

    /// Raise log level to debug
    #[serde(default)]
    pub debug: bool,

    /// Emit state uncompressed when explicitly false; default compresses
    #[serde(default)]
    pub compress_state: Option<bool>,

    /// Override the Events stream cursor field (default `datetime`)
    #[serde(default)]
    pub events_cursor: Option<String>,
}

impl ConnectorConfig {
    /// Parse a configuration from a JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::config(format!("Invalid connector config: {e}")))
    }

    /// Whether emitted state should be gzip-compressed
    pub fn compress_state(&self) -> bool {
        self.compress_state != Some(false)
    }
}

/// Authentication credentials, tagged by `auth_type`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "auth_type", rename_all = "snake_case")]
pub enum Credentials {
    /// Private API key authentication
    ApiKey {
        /// Klaviyo private key (`pk_...`)
        api_key: String,
    },
    /// OAuth refresh-token authentication
    Oauth {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

// ============================================================================
// Catalog
// ============================================================================

/// A discoverable stream, as emitted by `discover`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Stream name
    pub name: String,

    /// Declared JSON schema for records
    pub json_schema: Value,

    /// Supported sync modes
    pub supported_sync_modes: Vec<SyncMode>,

    /// Default cursor field, if the stream supports incremental sync
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cursor_field: Option<String>,

    /// Source-defined primary key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_defined_primary_key: Option<Vec<String>>,
}

/// Catalog of available streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

/// A stream selected for reading, with its chosen sync mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredStream {
    pub stream: CatalogEntry,
    pub sync_mode: SyncMode,
}

/// Catalog passed to `read`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredCatalog {
    pub streams: Vec<ConfiguredStream>,
}

impl ConfiguredCatalog {
    /// Parse a configured catalog from a JSON value
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::config(format!("Invalid catalog: {e}")))
    }
}

// ============================================================================
// Spec document
// ============================================================================

/// The JSON specification document emitted by the `spec` subcommand
pub fn spec_document() -> Value {
    json!({
        "documentationUrl": "https://developers.klaviyo.com/en/reference/api_overview",
        "connectionSpecification": {
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Klaviyo Source Spec",
            "type": "object",
            "required": ["credentials"],
            "properties": {
                "credentials": {
                    "type": "object",
                    "oneOf": [
                        {
                            "title": "API Key",
                            "required": ["auth_type", "api_key"],
                            "properties": {
                                "auth_type": {"type": "string", "const": "api_key"},
                                "api_key": {"type": "string", "airbyte_secret": true}
                            }
                        },
                        {
                            "title": "OAuth",
                            "required": ["auth_type", "client_id", "client_secret", "refresh_token"],
                            "properties": {
                                "auth_type": {"type": "string", "const": "oauth"},
                                "client_id": {"type": "string"},
                                "client_secret": {"type": "string", "airbyte_secret": true},
                                "refresh_token": {"type": "string", "airbyte_secret": true}
                            }
                        }
                    ]
                },
                "initialize": {
                    "type": "boolean",
                    "description": "Sort and filter streams by creation time instead of update time",
                    "default": false
                },
                "backfill": {
                    "type": "boolean",
                    "description": "Ignore saved state and do not update it",
                    "default": false
                },
                "max_stream_failures": {
                    "type": "integer",
                    "description": "Number of streams allowed to fail before the run fails (-1 = unlimited)"
                },
                "max_slice_failures": {
                    "type": "integer",
                    "description": "Number of slices allowed to fail per stream (-1 = unlimited)"
                },
                "debug": {"type": "boolean", "default": false},
                "compress_state": {
                    "type": "boolean",
                    "description": "Compress emitted state (default true)"
                }
            }
        }
    })
}
