// Allow common clippy pedantic lints that aren't critical for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]

//! # Klaviyo Source Connector
//!
//! Incrementally ingests data from the Klaviyo REST API and emits a
//! deterministic stream of records plus periodic state checkpoints as
//! newline-delimited JSON protocol messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        CLI surface                              │
//! │  spec    check --config    discover --config    read --config   │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │
//! ┌───────────────────────────────┴─────────────────────────────────┐
//! │ Sync Driver: topological order, checkpoints, failure budgets    │
//! └───────┬─────────────────────────────────────────────────────────┘
//!         │ per stream
//! ┌───────┴──────────┬──────────────┬──────────────┬────────────────┐
//! │  Shard Planner   │ Orchestrator │    Spool     │   Paginator    │
//! │  hourly ranges   │ parallel→seq │  disk buffer │  cursor pages  │
//! │  with overlap    │ + dedup      │  + tailing   │                │
//! └──────────────────┴──────────────┴──────┬───────┴────────────────┘
//!                                          │
//! ┌────────────────────────────────────────┴────────────────────────┐
//! │ HTTP: retrying invoker → per-endpoint rate limiter → reqwest    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

// ============================================================================
// Module declarations
// ============================================================================

/// Error types for the connector
pub mod error;

/// Common types and helpers
pub mod types;

/// Connector configuration and catalog types
pub mod config;

/// Protocol messages emitted on stdout
pub mod messages;

/// Cooperative cancellation
pub mod controller;

/// HTTP client, auth, retry and rate limiting
pub mod http;

/// Cursor pagination
pub mod pagination;

/// Time-range shard planning
pub mod shard;

/// Disk-spooled producer/consumer buffer
pub mod spool;

/// Parallel-sequential shard orchestration
pub mod orchestrator;

/// Stream implementations
pub mod streams;

/// State management and checkpointing
pub mod state;

/// Sync driver
pub mod driver;

/// Command-line interface
pub mod cli;

// ============================================================================
// Re-exports
// ============================================================================

pub use error::{Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
