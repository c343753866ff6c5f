//! Stream definitions
//!
//! One implementation of [`SourceStream`] per Klaviyo entity. The trait is
//! the seam the sync driver works against: cursor field, primary key, slice
//! generation and the record sequence itself.

mod base;
mod campaigns;
mod events;
mod flows;
mod metrics;
mod profiles;
mod templates;

pub use base::normalize;
pub use campaigns::CampaignsStream;
pub use events::EventsStream;
pub use flows::FlowsStream;
pub use metrics::MetricsStream;
pub use profiles::ProfilesStream;
pub use templates::TemplatesStream;

use crate::config::{CatalogEntry, ConnectorConfig};
use crate::controller::Controller;
use crate::error::Result;
use crate::http::SharedClient;
use crate::shard::Shard;
use crate::types::{value_to_epoch_ms, SyncMode};
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed record sequence
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// One unit of work inside a stream run
#[derive(Debug, Clone)]
pub enum Slice {
    /// The whole stream in one pass
    Whole,
    /// A time range (sharded streams re-slice internally)
    Range(Shard),
}

impl Slice {
    /// Identity used in logs and slice-failure accounting
    pub fn id(&self) -> Option<String> {
        match self {
            Slice::Whole => None,
            Slice::Range(shard) => Some(shard.id()),
        }
    }
}

/// Per-entity stream behavior
#[async_trait]
pub trait SourceStream: Send + Sync {
    /// Stream name as it appears in the catalog
    fn name(&self) -> &'static str;

    /// Record field holding the primary key
    fn primary_key(&self) -> Option<&'static str> {
        Some("id")
    }

    /// Record field holding the cursor; `None` means full refresh only
    fn cursor_field(&self) -> Option<String>;

    /// Declared record schema
    fn json_schema(&self) -> Value;

    /// Emit a checkpoint every this many records; 0 checkpoints only at
    /// slice boundaries
    fn checkpoint_interval(&self) -> u64 {
        10_000
    }

    /// Streams that must complete before this one starts
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn supports_incremental(&self) -> bool {
        self.cursor_field().is_some()
    }

    /// Idempotent pre-read hook
    async fn on_before_read(&self) -> Result<()> {
        Ok(())
    }

    /// Idempotent post-read hook
    async fn on_after_read(&self) -> Result<()> {
        Ok(())
    }

    /// Resolve the watermark the run starts from.
    ///
    /// Streams with a seeding policy (earliest-record peek, fixed epoch)
    /// override this; the result is recorded as the stream's cutoff before
    /// any record is read.
    async fn starting_cutoff(
        &self,
        _sync_mode: SyncMode,
        cutoff: Option<i64>,
        _ctl: &Controller,
    ) -> Result<Option<i64>> {
        Ok(cutoff)
    }

    /// Slice descriptors for this run; the default is the whole stream in
    /// one pass
    async fn slices(&self, _sync_mode: SyncMode, _cutoff: Option<i64>) -> Result<Vec<Slice>> {
        Ok(vec![Slice::Whole])
    }

    /// Lazy record sequence for one slice
    fn read_records(
        &self,
        sync_mode: SyncMode,
        slice: Slice,
        cutoff: Option<i64>,
        ctl: Controller,
    ) -> RecordStream;

    /// Fold a record into the watermark
    fn updated_state(&self, current: Option<i64>, record: &Value) -> Option<i64> {
        let Some(field) = self.cursor_field() else {
            return current;
        };
        let observed = record.get(&field).and_then(value_to_epoch_ms);
        match (current, observed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (None, Some(b)) => Some(b),
            (current, None) => current,
        }
    }

    /// Catalog entry advertised by `discover`
    fn catalog_entry(&self) -> CatalogEntry {
        let mut modes = vec![SyncMode::FullRefresh];
        if self.supports_incremental() {
            modes.push(SyncMode::Incremental);
        }
        CatalogEntry {
            name: self.name().to_string(),
            json_schema: self.json_schema(),
            supported_sync_modes: modes,
            default_cursor_field: self.cursor_field(),
            source_defined_primary_key: self
                .primary_key()
                .map(|k| vec![k.to_string()]),
        }
    }
}

/// Construct every stream this source provides
pub fn build_streams(
    config: &ConnectorConfig,
    client: SharedClient,
) -> Vec<Arc<dyn SourceStream>> {
    vec![
        Arc::new(EventsStream::new(config, Arc::clone(&client))),
        Arc::new(ProfilesStream::new(config, Arc::clone(&client))),
        Arc::new(CampaignsStream::new(config, Arc::clone(&client))),
        Arc::new(FlowsStream::new(config, Arc::clone(&client))),
        Arc::new(TemplatesStream::new(config, Arc::clone(&client))),
        Arc::new(MetricsStream::new(client)),
    ]
}
