//! Error types for the Klaviyo source
//!
//! This module defines the error hierarchy for the whole crate.
//! All public APIs return `Result<T, Error>` where Error is defined here.
//!
//! The variants follow the connector's failure taxonomy: transient errors are
//! absorbed by retry, client faults bubble to the shard, non-fatal errors are
//! absorbed by the stream loop, and cancellation is suppressed at the
//! orchestrator boundary in favor of the original fault.

use thiserror::Error;

/// The main error type for the Klaviyo source
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Missing required config field: {field}")]
    MissingConfigField { field: String },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Authentication Errors
    // ============================================================================
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Token refresh failed ({code}): {message}")]
    TokenRefresh { code: String, message: String },

    // ============================================================================
    // HTTP Errors
    // ============================================================================
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Rate limited, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Max retries ({max_attempts}) exceeded")]
    MaxRetriesExceeded { max_attempts: u32 },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ============================================================================
    // Stream / Sync Errors
    // ============================================================================
    #[error("Stream '{stream}' not found in catalog")]
    StreamNotFound { stream: String },

    #[error("Dependency cycle among streams: {streams:?}")]
    DependencyCycle { streams: Vec<String> },

    /// Advisory error raised by a stream to skip the current slice and
    /// continue with the next one.
    #[error("Non-fatal error in stream '{stream}': {message}")]
    NonFatal { stream: String, message: String },

    #[error("Streams failed: {streams:?}")]
    StreamFailures { streams: Vec<String> },

    // ============================================================================
    // Spool / State Errors
    // ============================================================================
    #[error("Spool error: {message}")]
    Spool { message: String },

    #[error("State error: {message}")]
    State { message: String },

    // ============================================================================
    // Cancellation & I/O
    // ============================================================================
    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingConfigField {
            field: field.into(),
        }
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create an HTTP status error
    pub fn http_status(status: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            body: body.into(),
        }
    }

    /// Create a non-fatal per-slice error
    pub fn non_fatal(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NonFatal {
            stream: stream.into(),
            message: message.into(),
        }
    }

    /// Create a spool error
    pub fn spool(message: impl Into<String>) -> Self {
        Self::Spool {
            message: message.into(),
        }
    }

    /// Create a state error
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Check if this error is retryable by the default retry profile
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_) | Error::RateLimited { .. } => true,
            Error::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Check if this error is a client fault (HTTP 400-class, not 429)
    pub fn is_client_fault(&self) -> bool {
        matches!(self, Error::HttpStatus { status, .. } if (400..500).contains(status) && *status != 429)
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if this error is an advisory skip-and-continue error
    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Error::NonFatal { .. })
    }
}

/// Check if an HTTP status code is retryable
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

/// Propagate an error through `?` inside stream generator bodies
pub fn bail(err: Error) -> Result<()> {
    Err(err)
}

/// Result type alias for the Klaviyo source
pub type Result<T> = std::result::Result<T, Error>;
