//! Per-endpoint rate limiting
//!
//! Every endpoint key owns one limiter enforcing three budgets at once:
//!
//! - a reservoir of `steady` tokens, refilled to `steady` every 60 seconds on
//!   an absolute cadence (not sliding),
//! - a minimum inter-dispatch spacing of `1000/burst × 1.25` ms, enforced by
//!   a governor quota cell,
//! - at most 20 calls in flight.
//!
//! Dispatch is FIFO per key (the tokio mutex queues fairly). A cancelled
//! caller abandons its slot without consuming a reservoir token.

use crate::controller::Controller;
use crate::error::{Error, Result};
use crate::http::endpoints;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

/// Maximum in-flight calls per endpoint key
pub const MAX_IN_FLIGHT: usize = 20;

/// Reservoir refill cadence
const REFILL_WINDOW: Duration = Duration::from_secs(60);

/// Safety factor applied to the burst spacing
const SPACING_FACTOR: f64 = 1.25;

type SpacingCell = Governor<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Registry of per-endpoint limiters, lazily created
pub struct RateLimiterRegistry {
    limiters: std::sync::Mutex<HashMap<&'static str, Arc<EndpointLimiter>>>,
}

impl RateLimiterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            limiters: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the limiter for an endpoint key.
    ///
    /// # Panics
    ///
    /// Panics on a key absent from the endpoint table; calling with an
    /// unknown key is an implementer error, not a runtime condition.
    pub fn limiter(&self, key: &str) -> Arc<EndpointLimiter> {
        let endpoint = endpoints::lookup(key)
            .unwrap_or_else(|| panic!("unknown endpoint key: {key}"));
        let mut limiters = self.limiters.lock().expect("limiter registry poisoned");
        Arc::clone(
            limiters
                .entry(endpoint.key)
                .or_insert_with(|| Arc::new(EndpointLimiter::new(endpoint.burst, endpoint.steady))),
        )
    }

    /// Schedule a call against an endpoint's budget
    pub async fn schedule<T, F, Fut>(&self, key: &str, ctl: &Controller, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.limiter(key).schedule(ctl, f).await
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterRegistry").finish()
    }
}

/// Reservoir refilled on an absolute cadence
struct Reservoir {
    tokens: u32,
    steady: u32,
    window_start: Instant,
}

/// Budget enforcement for a single endpoint key
pub struct EndpointLimiter {
    inflight: Semaphore,
    dispatch: Mutex<Reservoir>,
    spacing: SpacingCell,
    window: Duration,
}

impl EndpointLimiter {
    /// Create a limiter with the standard 60-second refill window
    pub fn new(burst: u32, steady: u32) -> Self {
        Self::with_window(burst, steady, REFILL_WINDOW)
    }

    /// Create a limiter with a custom refill window
    pub fn with_window(burst: u32, steady: u32, window: Duration) -> Self {
        let spacing_interval = Duration::from_secs_f64(SPACING_FACTOR / f64::from(burst.max(1)));
        let quota = Quota::with_period(spacing_interval)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()));

        Self {
            inflight: Semaphore::new(MAX_IN_FLIGHT),
            dispatch: Mutex::new(Reservoir {
                tokens: steady,
                steady,
                window_start: Instant::now(),
            }),
            spacing: Governor::direct(quota),
            window,
        }
    }

    /// Wait for an in-flight slot, a reservoir token and the burst spacing,
    /// then run the call. FIFO with respect to other callers on this limiter.
    pub async fn schedule<T, F, Fut>(&self, ctl: &Controller, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = tokio::select! {
            permit = self.inflight.acquire() => {
                permit.expect("in-flight semaphore never closed")
            }
            () = ctl.aborted() => return Err(Error::Cancelled),
        };

        {
            let mut reservoir = tokio::select! {
                guard = self.dispatch.lock() => guard,
                () = ctl.aborted() => return Err(Error::Cancelled),
            };

            loop {
                let now = Instant::now();
                while now >= reservoir.window_start + self.window {
                    reservoir.window_start += self.window;
                    reservoir.tokens = reservoir.steady;
                }
                if reservoir.tokens > 0 {
                    break;
                }
                let next_refill = reservoir.window_start + self.window;
                tokio::select! {
                    () = tokio::time::sleep_until(next_refill) => {}
                    () = ctl.aborted() => return Err(Error::Cancelled),
                }
            }

            tokio::select! {
                _ = self.spacing.until_ready() => {}
                () = ctl.aborted() => return Err(Error::Cancelled),
            }

            reservoir.tokens -= 1;
        }

        tokio::select! {
            result = f() => result,
            () = ctl.aborted() => Err(Error::Cancelled),
        }
    }
}

impl std::fmt::Debug for EndpointLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointLimiter")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod rate_limit_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_spacing_between_dispatches() {
        // burst = 100 -> spacing 12.5ms
        let limiter = EndpointLimiter::new(100, 10_000);
        let ctl = Controller::new();

        let start = std::time::Instant::now();
        for _ in 0..4 {
            limiter.schedule(&ctl, || async { Ok(()) }).await.unwrap();
        }
        // three gaps of >= 12.5ms after the first immediate dispatch
        assert!(start.elapsed() >= Duration::from_millis(36));
    }

    #[tokio::test]
    async fn test_reservoir_delays_until_refill() {
        let limiter = EndpointLimiter::with_window(1000, 2, Duration::from_millis(200));
        let ctl = Controller::new();

        let start = std::time::Instant::now();
        for _ in 0..3 {
            limiter.schedule(&ctl, || async { Ok(()) }).await.unwrap();
        }
        // third call must wait for the window refill
        assert!(start.elapsed() >= Duration::from_millis(180));
    }

    #[tokio::test]
    async fn test_in_flight_bound() {
        let limiter = Arc::new(EndpointLimiter::new(100_000, 1_000_000));
        let ctl = Controller::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let limiter = Arc::clone(&limiter);
            let ctl = ctl.clone();
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                limiter
                    .schedule(&ctl, || async {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= MAX_IN_FLIGHT);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_abandons_promptly() {
        let limiter = Arc::new(EndpointLimiter::with_window(1000, 1, Duration::from_secs(60)));
        let ctl = Controller::new();

        // consume the only token of the window
        limiter.schedule(&ctl, || async { Ok(()) }).await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let ctl = ctl.clone();
            tokio::spawn(async move { limiter.schedule(&ctl, || async { Ok(()) }).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        ctl.abort();

        let result = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_registry_reuses_limiters() {
        let registry = RateLimiterRegistry::new();
        let a = registry.limiter("GET:/events/");
        let b = registry.limiter("GET:/events/");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    #[should_panic(expected = "unknown endpoint key")]
    async fn test_unknown_key_panics() {
        let registry = RateLimiterRegistry::new();
        let _ = registry.limiter("GET:/made-up/");
    }
}
