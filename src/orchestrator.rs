//! Parallel-sequential shard orchestration
//!
//! Runs N shard producers concurrently but yields their records strictly in
//! shard-generation order. Each shard writes through its own disk spool; the
//! consumer drains spools one at a time, deduplicating across adjacent
//! shards where the overlap widening can duplicate records.

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::shard::Shard;
use crate::spool::Spool;
use crate::types::{value_to_epoch_ms, value_to_key};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Only keys whose cursor falls inside this window before the next shard's
/// start can re-appear in the next shard's overlap; older keys are dropped
/// to bound dedup memory.
const DEDUP_WINDOW_MS: i64 = 2 * 60 * 1000;

/// Field names for cross-shard dedup
#[derive(Debug, Clone)]
pub struct DedupKeys {
    pub primary_key: String,
    pub cursor_field: String,
}

/// Shard scheduling configuration
#[derive(Debug, Clone)]
pub struct Orchestrator {
    /// Concurrency gate over shard producers
    pub parallel: usize,
    /// Cross-shard dedup keys; `None` disables dedup entirely
    pub dedup: Option<DedupKeys>,
}

impl Orchestrator {
    /// Run every shard's producer under the concurrency gate, spool each to
    /// disk, and drain the spools in shard order.
    ///
    /// The first producer failure (other than cancellation) aborts the
    /// controller; the returned stream then fails with that original error.
    /// Spool files are removed as each shard drains, and best-effort on the
    /// failure path.
    pub fn run<F, S>(
        self,
        spool_dir: PathBuf,
        shards: Vec<Shard>,
        ctl: Controller,
        producer: F,
    ) -> impl Stream<Item = Result<Value>> + Send + 'static
    where
        F: Fn(Shard) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        try_stream! {
            let gate = Arc::new(Semaphore::new(self.parallel.max(1)));
            let mut queue: VecDeque<(Shard, Arc<Spool>, JoinHandle<Result<()>>)> =
                VecDeque::with_capacity(shards.len());

            for shard in shards {
                let spool = Arc::new(Spool::create(
                    &spool_dir,
                    &format!("shard-{:05}", shard.index),
                )?);
                let handle = {
                    let gate = Arc::clone(&gate);
                    let spool = Arc::clone(&spool);
                    let ctl = ctl.clone();
                    // lazy: nothing runs until the writer polls it under a permit
                    let records = producer(shard.clone());
                    tokio::spawn(async move {
                        let _permit = tokio::select! {
                            permit = gate.acquire_owned() => {
                                permit.expect("shard gate never closed")
                            }
                            () = ctl.aborted() => return Err(Error::Cancelled),
                        };
                        spool.write(records, &ctl).await
                    })
                };
                queue.push_back((shard, spool, handle));
            }

            let mut last_ids: HashSet<String> = HashSet::new();
            let mut current_ids: HashSet<String> = HashSet::new();
            let mut run_error: Option<Error> = None;

            while let Some((shard, spool, handle)) = queue.pop_front() {
                let window_start_ms = shard.base_to.timestamp_millis() - DEDUP_WINDOW_MS;
                let mut failed: Option<Error> = None;

                {
                    let tail = spool.tail(ctl.clone());
                    futures::pin_mut!(tail);
                    while let Some(item) = tail.next().await {
                        let record = match item {
                            Ok(record) => record,
                            Err(e) => {
                                failed = Some(e);
                                break;
                            }
                        };

                        if let Some(keys) = &self.dedup {
                            if let Some(key) =
                                record.get(&keys.primary_key).and_then(value_to_key)
                            {
                                if last_ids.contains(&key) {
                                    continue;
                                }
                                if !shard.is_last {
                                    let in_window = record
                                        .get(&keys.cursor_field)
                                        .and_then(value_to_epoch_ms)
                                        .is_some_and(|ms| ms >= window_start_ms);
                                    if in_window {
                                        current_ids.insert(key);
                                    }
                                }
                            }
                        }
                        yield record;
                    }
                }

                let write_result = match handle.await {
                    Ok(result) => result,
                    Err(join_err) => {
                        Err(Error::spool(format!("shard writer panicked: {join_err}")))
                    }
                };
                if failed.is_none() {
                    if let Err(e) = write_result {
                        failed = Some(e);
                    }
                }

                if let Some(first) = failed {
                    ctl.abort();
                    spool.cleanup().await;

                    // Prefer the first non-cancellation error over the
                    // cancellations it caused.
                    let mut original = (!first.is_cancelled()).then_some(first);
                    while let Some((_, other_spool, other_handle)) = queue.pop_front() {
                        if let Ok(Err(e)) = other_handle.await {
                            if original.is_none() && !e.is_cancelled() {
                                original = Some(e);
                            }
                        }
                        other_spool.cleanup().await;
                    }
                    run_error = Some(original.unwrap_or(Error::Cancelled));
                    break;
                }

                spool.cleanup().await;
                last_ids = std::mem::take(&mut current_ids);
            }

            if let Some(e) = run_error {
                crate::error::bail(e)?;
            }
        }
    }
}
