//! Cooperative cancellation for a stream run
//!
//! A single `Controller` is shared by every long-running operation of one
//! stream run: limiter waits, HTTP calls, spool writers and readers. The
//! first unrecoverable error aborts it; every observer abandons its work and
//! propagates `Error::Cancelled`, which the orchestrator suppresses in favor
//! of the original fault.

use tokio::sync::watch;

/// Cancellation controller, cheap to clone
#[derive(Debug, Clone)]
pub struct Controller {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl Controller {
    /// Create a new, un-aborted controller
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Signal every observer to abandon its work
    pub fn abort(&self) {
        // send_replace never fails; the sender is kept alive by self
        self.tx.send_replace(true);
    }

    /// Check without waiting
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the controller is aborted
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: impossible while self exists, but never hang
                return;
            }
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_wakes_waiters() {
        let ctl = Controller::new();
        assert!(!ctl.is_aborted());

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                ctl.aborted().await;
                true
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctl.abort();

        let woke = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(woke);
        assert!(ctl.is_aborted());
    }

    #[tokio::test]
    async fn test_aborted_resolves_immediately_when_already_aborted() {
        let ctl = Controller::new();
        ctl.abort();
        tokio::time::timeout(Duration::from_millis(100), ctl.aborted())
            .await
            .unwrap();
    }
}
