//! Retry with exponential backoff
//!
//! Two profiles are used in practice: the API profile wraps every data call
//! and retries anything that is not a client fault; the token-refresh profile
//! wraps OAuth refresh calls and only retries the token endpoint's
//! `rate_limit_exceeded` reply.

use crate::controller::Controller;
use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for a retry loop
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Profile for data-plane API calls
    pub fn api() -> Self {
        Self {
            initial: Duration::from_secs(30),
            factor: 2,
            cap: Duration::from_secs(120),
            max_attempts: 100,
        }
    }

    /// Profile for OAuth token refresh
    pub fn token_refresh() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }

    /// Minimal delays for tests
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            factor: 2,
            cap: Duration::from_millis(10),
            max_attempts: 5,
        }
    }

    /// Backoff delay before the given retry (0-based attempt index)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.saturating_pow(attempt);
        std::cmp::min(self.initial.saturating_mul(factor), self.cap)
    }
}

/// Retry `op` under `policy` while `should_retry` accepts the error.
///
/// A 429 reply's `Retry-After` stretches the backoff delay when it exceeds
/// the computed one. Cancellation aborts the wait immediately.
pub async fn with_retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    ctl: &Controller,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if err.is_cancelled() || !should_retry(&err) {
                    return Err(err);
                }
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(err);
                }

                let mut delay = policy.delay(attempt - 1);
                if let Error::RateLimited {
                    retry_after_seconds,
                } = &err
                {
                    delay = std::cmp::max(delay, Duration::from_secs(*retry_after_seconds));
                }

                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {err}"
                );

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctl.aborted() => return Err(Error::Cancelled),
                }
            }
        }
    }
}

/// Retry with the default predicate: everything retryable except client faults
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, ctl: &Controller, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_if(policy, ctl, Error::is_retryable, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_progression() {
        let policy = RetryPolicy::api();
        assert_eq!(policy.delay(0), Duration::from_secs(30));
        assert_eq!(policy.delay(1), Duration::from_secs(60));
        assert_eq!(policy.delay(2), Duration::from_secs(120));
        // capped
        assert_eq!(policy.delay(3), Duration::from_secs(120));
        assert_eq!(policy.delay(30), Duration::from_secs(120));
    }

    #[test]
    fn test_token_refresh_profile() {
        let policy = RetryPolicy::token_refresh();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(16));
        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.max_attempts, 10);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let ctl = Controller::new();

        let result = with_retry(&RetryPolicy::fast(), &ctl, || {
            let attempts = Arc::clone(&attempts);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::http_status(503, "unavailable"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_fault_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let ctl = Controller::new();

        let result: Result<()> = with_retry(&RetryPolicy::fast(), &ctl, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::http_status(400, "bad filter"))
            }
        })
        .await;

        assert!(result.unwrap_err().is_client_fault());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let ctl = Controller::new();
        let policy = RetryPolicy::fast();

        let result: Result<()> = with_retry(&policy, &ctl, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::http_status(500, "boom"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), policy.max_attempts as usize);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let ctl = Controller::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        // only retry the token endpoint's throttle code
        let pred = |e: &Error| {
            matches!(e, Error::TokenRefresh { code, .. } if code == "rate_limit_exceeded")
        };

        let result: Result<()> = with_retry_if(&RetryPolicy::fast(), &ctl, pred, || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::TokenRefresh {
                    code: "invalid_grant".to_string(),
                    message: "revoked".to_string(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let ctl = Controller::new();
        let slow = RetryPolicy {
            initial: Duration::from_secs(60),
            factor: 2,
            cap: Duration::from_secs(60),
            max_attempts: 3,
        };

        let handle = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                with_retry(&slow, &ctl, || async {
                    Err::<(), _>(Error::http_status(500, "boom"))
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctl.abort();

        let result = tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
