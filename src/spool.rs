//! Disk spool: append-only NDJSON buffer with a tailing reader
//!
//! One spool bridges a single shard's producer and the sequential consumer.
//! Spooling to disk bounds memory independent of shard size; the tailing
//! reader starts draining before the producer finishes, giving pipeline
//! overlap without unbounded queues.
//!
//! Exactly one writer and one reader per spool. `tail()` may only be called
//! once.

use crate::controller::Controller;
use crate::error::{Error, Result};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;

/// Writes are coalesced until this many bytes are buffered
const WRITE_BUFFER: usize = 64 * 1024;

/// Reads happen in chunks of this size
const READ_CHUNK: usize = 512 * 1024;

/// A single shard's disk buffer
pub struct Spool {
    path: PathBuf,
    done: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
}

impl Spool {
    /// Create the spool file (empty) so the reader can open it immediately
    pub fn create(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(format!("{name}.jsonl"));
        std::fs::File::create(&path)?;
        Ok(Self {
            path,
            done: Arc::new(AtomicBool::new(false)),
            wakeup: Arc::new(Notify::new()),
        })
    }

    /// Spool file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain the producer into the file.
    ///
    /// Sets the done flag and wakes the reader on every exit path. A
    /// producer error (other than cancellation) aborts the controller.
    pub async fn write<S>(&self, records: S, ctl: &Controller) -> Result<()>
    where
        S: Stream<Item = Result<Value>> + Send,
    {
        let result = self.write_inner(records, ctl).await;

        self.done.store(true, Ordering::Release);
        self.wakeup.notify_waiters();

        if let Err(ref e) = result {
            if !e.is_cancelled() {
                ctl.abort();
            }
        }
        result
    }

    async fn write_inner<S>(&self, records: S, ctl: &Controller) -> Result<()>
    where
        S: Stream<Item = Result<Value>> + Send,
    {
        let mut file = OpenOptions::new().append(true).open(&self.path).await?;
        let mut buf: Vec<u8> = Vec::with_capacity(WRITE_BUFFER + 4096);

        futures::pin_mut!(records);
        loop {
            let item = tokio::select! {
                item = records.next() => item,
                () = ctl.aborted() => return Err(Error::Cancelled),
            };
            let Some(item) = item else { break };
            let record = item?;

            serde_json::to_writer(&mut buf, &record)?;
            buf.push(b'\n');

            if buf.len() >= WRITE_BUFFER {
                tokio::select! {
                    r = file.write_all(&buf) => r?,
                    () = ctl.aborted() => return Err(Error::Cancelled),
                }
                buf.clear();
                self.wakeup.notify_waiters();
            }
        }

        if !buf.is_empty() {
            file.write_all(&buf).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Yield decoded records as they land on disk.
    ///
    /// At end of file with the writer still running, waits for the writer's
    /// next flush or for completion, whichever comes first. A final
    /// unterminated line is decoded once the writer is done.
    pub fn tail(&self, ctl: Controller) -> impl Stream<Item = Result<Value>> + Send + 'static {
        let path = self.path.clone();
        let done = Arc::clone(&self.done);
        let wakeup = Arc::clone(&self.wakeup);

        try_stream! {
            let mut file = File::open(&path).await?;
            let mut chunk = vec![0u8; READ_CHUNK];
            let mut carry: Vec<u8> = Vec::new();

            loop {
                let n = file.read(&mut chunk).await?;
                if n > 0 {
                    for record in drain_lines(&mut carry, &chunk[..n])? {
                        yield record;
                    }
                    continue;
                }

                // Register before re-checking done so a concurrent
                // flush-then-complete cannot be missed.
                let notified = wakeup.notified();
                if done.load(Ordering::Acquire) {
                    // drain bytes flushed between our read and the flag
                    loop {
                        let n = file.read(&mut chunk).await?;
                        if n == 0 {
                            break;
                        }
                        for record in drain_lines(&mut carry, &chunk[..n])? {
                            yield record;
                        }
                    }
                    break;
                }
                let waited: Result<()> = tokio::select! {
                    () = notified => Ok(()),
                    () = ctl.aborted() => Err(Error::Cancelled),
                };
                waited?;
            }

            if !carry.is_empty() {
                let record: Value = serde_json::from_slice(&carry)?;
                yield record;
            }
        }
    }

    /// Remove the spool file; idempotent
    pub async fn cleanup(&self) {
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

impl std::fmt::Debug for Spool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spool")
            .field("path", &self.path)
            .field("done", &self.done.load(Ordering::Relaxed))
            .finish()
    }
}

/// Append incoming bytes and decode every complete line; the trailing
/// partial line stays in `carry` for the next chunk.
fn drain_lines(carry: &mut Vec<u8>, incoming: &[u8]) -> Result<Vec<Value>> {
    carry.extend_from_slice(incoming);

    let mut records = Vec::new();
    let mut start = 0;
    while let Some(pos) = carry[start..].iter().position(|&b| b == b'\n') {
        let line = &carry[start..start + pos];
        if !line.is_empty() {
            records.push(serde_json::from_slice(line)?);
        }
        start += pos + 1;
    }
    carry.drain(..start);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use std::time::Duration;

    fn records(values: Vec<Value>) -> impl Stream<Item = Result<Value>> + Send {
        stream::iter(values.into_iter().map(Ok))
    }

    #[test]
    fn test_drain_lines_partial_carry() {
        let mut carry = Vec::new();

        let out = drain_lines(&mut carry, b"{\"id\":1}\n{\"id\"").unwrap();
        assert_eq!(out, vec![json!({"id": 1})]);
        assert_eq!(carry, b"{\"id\"");

        let out = drain_lines(&mut carry, b":2}\n{\"id\":3}\n").unwrap();
        assert_eq!(out, vec![json!({"id": 2}), json!({"id": 3})]);
        assert!(carry.is_empty());
    }

    #[tokio::test]
    async fn test_write_then_tail_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::create(dir.path(), "shard-0").unwrap();
        let ctl = Controller::new();

        let values: Vec<Value> = (0..100).map(|i| json!({"id": i})).collect();
        spool.write(records(values.clone()), &ctl).await.unwrap();

        let got: Vec<Value> = spool
            .tail(ctl.clone())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(got, values);

        spool.cleanup().await;
        assert!(!spool.path().exists());
        // idempotent
        spool.cleanup().await;
    }

    #[tokio::test]
    async fn test_tail_overlaps_slow_writer() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(Spool::create(dir.path(), "shard-slow").unwrap());
        let ctl = Controller::new();

        let writer = {
            let spool = Arc::clone(&spool);
            let ctl = ctl.clone();
            tokio::spawn(async move {
                let slow = try_stream! {
                    for i in 0..5 {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        yield json!({"id": i});
                    }
                };
                spool.write(slow, &ctl).await
            })
        };

        let got: Vec<Value> = spool
            .tail(ctl.clone())
            .map(|r| r.unwrap())
            .collect()
            .await;

        writer.await.unwrap().unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(got[4]["id"], 4);
    }

    #[tokio::test]
    async fn test_producer_error_aborts_controller() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::create(dir.path(), "shard-err").unwrap();
        let ctl = Controller::new();

        let failing = try_stream! {
            yield json!({"id": 1});
            crate::error::bail(Error::http_status(500, "upstream died"))?;
        };

        let err = spool.write(failing, &ctl).await.unwrap_err();
        assert!(matches!(err, Error::HttpStatus { status: 500, .. }));
        assert!(ctl.is_aborted());
    }

    #[tokio::test]
    async fn test_cancelled_writer_does_not_reabort() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::create(dir.path(), "shard-cancel").unwrap();
        let ctl = Controller::new();
        ctl.abort();

        let pending = try_stream! {
            tokio::time::sleep(Duration::from_secs(60)).await;
            yield json!({"id": 1});
        };

        let err = spool.write(pending, &ctl).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_tail_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Spool::create(dir.path(), "shard-tail-cancel").unwrap();
        let ctl = Controller::new();

        // no writer: the reader parks on the notify
        let mut tail = Box::pin(spool.tail(ctl.clone()));
        let reader = tokio::spawn(async move { tail.next().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctl.abort();

        let item = tokio::time::timeout(Duration::from_millis(500), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(item, Some(Err(Error::Cancelled))));
    }
}
