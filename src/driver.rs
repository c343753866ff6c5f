//! Sync driver
//!
//! Drives every configured stream in dependency order and emits the
//! protocol message sequence: per-stream RUNNING/SUCCESS/ERRORED statuses,
//! RECORDs, and STATE checkpoints. Checkpoints land only at record
//! boundaries, after the record that produced the new watermark.

use crate::config::{ConfiguredCatalog, ConnectorConfig};
use crate::controller::Controller;
use crate::error::{bail, Error, Result};
use crate::messages::Message;
use crate::state::StateManager;
use crate::streams::SourceStream;
use crate::types::{LogLevel, SyncMode};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Boxed message sequence returned by [`SyncDriver::read`]
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message>> + Send>>;

/// Orchestrates one `read` invocation
pub struct SyncDriver {
    config: ConnectorConfig,
    streams: Vec<Arc<dyn SourceStream>>,
}

impl SyncDriver {
    pub fn new(config: ConnectorConfig, streams: Vec<Arc<dyn SourceStream>>) -> Self {
        Self { config, streams }
    }

    /// Run the sync and yield the ordered message sequence.
    ///
    /// The stream ends with `Err` when the run fails; every failure has
    /// already produced an ERRORED status and a final STATE by then.
    pub fn read(self, catalog: ConfiguredCatalog, state: Option<Value>) -> MessageStream {
        let Self { config, streams } = self;

        Box::pin(try_stream! {
            let backfill = config.backfill;
            let mut manager = StateManager::parse(
                if backfill { None } else { state.as_ref() },
                config.compress_state(),
            )?;

            let by_name: HashMap<&str, Arc<dyn SourceStream>> = streams
                .iter()
                .map(|s| (s.name(), Arc::clone(s)))
                .collect();

            let mut requested = Vec::new();
            for configured in &catalog.streams {
                let Some(stream) = by_name.get(configured.stream.name.as_str()) else {
                    let err = Error::StreamNotFound {
                        stream: configured.stream.name.clone(),
                    };
                    yield Message::run_errored(err.to_string());
                    bail(err)?;
                    unreachable!();
                };
                // incremental on a cursor-less stream degrades to full refresh
                let mode = if configured.sync_mode == SyncMode::Incremental
                    && stream.supports_incremental()
                {
                    SyncMode::Incremental
                } else {
                    SyncMode::FullRefresh
                };
                requested.push((Arc::clone(stream), mode));
            }

            let ordered = match topo_sort(requested) {
                Ok(ordered) => ordered,
                Err(err) => {
                    yield Message::run_errored(err.to_string());
                    bail(err)?;
                    unreachable!();
                }
            };

            let stream_budget = config.max_stream_failures;
            let mut failed_streams: Vec<String> = Vec::new();

            for (stream, sync_mode) in ordered {
                let name = stream.name();
                let started = Instant::now();
                let ctl = Controller::new();
                let mut records_emitted: u64 = 0;
                let mut stream_error: Option<Error> = None;
                let mut slice_budget = config.max_slice_failures;

                info!(stream = name, ?sync_mode, "starting stream");
                yield Message::log(LogLevel::Info, format!("Starting stream {name}"));
                yield Message::stream_running(name);

                if let Err(e) = stream.on_before_read().await {
                    stream_error = Some(e);
                }

                // Resolve the starting watermark (seeding included) before
                // any record is read, so even an empty run checkpoints it.
                let mut effective_cutoff: Option<i64> = None;
                if stream_error.is_none() {
                    let prior = if backfill || sync_mode == SyncMode::FullRefresh {
                        None
                    } else {
                        manager.cutoff(name)
                    };
                    match stream.starting_cutoff(sync_mode, prior, &ctl).await {
                        Ok(cutoff) => {
                            effective_cutoff = cutoff;
                            if !backfill {
                                if let Some(c) = cutoff {
                                    manager.advance(name, c);
                                }
                            }
                        }
                        Err(e) => stream_error = Some(e),
                    }
                }

                if stream_error.is_none() {
                    match stream.slices(sync_mode, effective_cutoff).await {
                        Err(e) => stream_error = Some(e),
                        Ok(slices) => {
                            'slices: for slice in slices {
                                let slice_id = slice.id();
                                let cutoff = match sync_mode {
                                    SyncMode::FullRefresh => effective_cutoff,
                                    SyncMode::Incremental if backfill => effective_cutoff,
                                    SyncMode::Incremental => {
                                        manager.cutoff(name).or(effective_cutoff)
                                    }
                                };
                                let mut records =
                                    stream.read_records(sync_mode, slice, cutoff, ctl.clone());

                                loop {
                                    match records.next().await {
                                        None => break,
                                        Some(Ok(record)) => {
                                            let new_cutoff = if backfill {
                                                None
                                            } else {
                                                stream.updated_state(
                                                    manager.cutoff(name),
                                                    &record,
                                                )
                                            };
                                            yield Message::record(name, record);
                                            records_emitted += 1;

                                            if !backfill {
                                                if let Some(cutoff) = new_cutoff {
                                                    manager.advance(name, cutoff);
                                                }
                                                let interval = stream.checkpoint_interval();
                                                if interval > 0
                                                    && records_emitted % interval == 0
                                                {
                                                    yield Message::state(manager.snapshot());
                                                }
                                            }
                                        }
                                        Some(Err(e)) if e.is_non_fatal() => {
                                            warn!(stream = name, "non-fatal slice error: {e}");
                                            yield Message::advisory(name, e.to_string());
                                            if !backfill {
                                                yield Message::state(manager.snapshot());
                                            }
                                            continue 'slices;
                                        }
                                        Some(Err(e)) => {
                                            let consumed = !e.is_cancelled()
                                                && consume_slice_budget(
                                                    &slice_id,
                                                    &mut slice_budget,
                                                );
                                            if consumed {
                                                warn!(
                                                    stream = name,
                                                    slice = slice_id.as_deref(),
                                                    "slice failed, continuing: {e}"
                                                );
                                                yield Message::advisory(name, e.to_string());
                                                continue 'slices;
                                            }
                                            stream_error = Some(e);
                                            break 'slices;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                if let Err(e) = stream.on_after_read().await {
                    warn!(stream = name, "after-read hook failed: {e}");
                }

                match stream_error {
                    None => {
                        info!(
                            stream = name,
                            records = records_emitted,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "stream complete"
                        );
                        if !backfill {
                            yield Message::state(manager.snapshot());
                        }
                        yield Message::log(
                            LogLevel::Info,
                            format!("Read {records_emitted} records from {name}"),
                        );
                        yield Message::stream_success(name, records_emitted);
                    }
                    Some(e) => {
                        ctl.abort();
                        yield Message::stream_errored(name, records_emitted, e.to_string());
                        if !backfill {
                            yield Message::state(manager.snapshot());
                        }

                        let fatal = e.is_cancelled()
                            || matches!(
                                e,
                                Error::DependencyCycle { .. } | Error::StreamNotFound { .. }
                            );
                        let within_budget = match stream_budget {
                            Some(-1) => true,
                            Some(allowed) => (failed_streams.len() as i64) < allowed,
                            None => false,
                        };

                        if fatal || !within_budget {
                            yield Message::run_errored(e.to_string());
                            bail(e)?;
                            unreachable!();
                        }
                        warn!(stream = name, "stream failed within budget: {e}");
                        failed_streams.push(name.to_string());
                    }
                }
            }

            if !failed_streams.is_empty() {
                let err = Error::StreamFailures {
                    streams: failed_streams,
                };
                yield Message::run_errored(err.to_string());
                if !backfill {
                    yield Message::state(manager.snapshot());
                }
                bail(err)?;
            }
        })
    }
}

/// Spend one unit of the slice budget; only slices with an identity count
fn consume_slice_budget(slice_id: &Option<String>, budget: &mut Option<i64>) -> bool {
    if slice_id.is_none() {
        return false;
    }
    match budget {
        Some(-1) => true,
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

/// Order streams so every dependency precedes its dependents.
///
/// Dependencies on streams that were not requested are ignored; a cycle is a
/// fatal error.
fn topo_sort(
    requested: Vec<(Arc<dyn SourceStream>, SyncMode)>,
) -> Result<Vec<(Arc<dyn SourceStream>, SyncMode)>> {
    let catalog_order: Vec<&str> = requested.iter().map(|(s, _)| s.name()).collect();
    let names: HashSet<&str> = catalog_order.iter().copied().collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (stream, _) in &requested {
        let deps: Vec<&str> = stream
            .dependencies()
            .into_iter()
            .filter(|d| names.contains(d))
            .collect();
        in_degree.insert(stream.name(), deps.len());
        for dep in deps {
            dependents.entry(dep).or_default().push(stream.name());
        }
    }

    let mut by_name: HashMap<&str, (Arc<dyn SourceStream>, SyncMode)> = requested
        .into_iter()
        .map(|(s, m)| (s.name(), (s, m)))
        .collect();

    // catalog order is preserved among streams that are ready together
    let mut ready: VecDeque<&str> = catalog_order
        .iter()
        .copied()
        .filter(|name| in_degree[name] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(by_name.len());

    while let Some(name) = ready.pop_front() {
        if let Some(entry) = by_name.remove(name) {
            ordered.push(entry);
        }
        for dependent in dependents.remove(name).unwrap_or_default() {
            let degree = in_degree
                .get_mut(dependent)
                .expect("dependent is always a requested stream");
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if !by_name.is_empty() {
        let mut cycle: Vec<String> = by_name.keys().map(|s| (*s).to_string()).collect();
        cycle.sort();
        return Err(Error::DependencyCycle { streams: cycle });
    }
    Ok(ordered)
}
