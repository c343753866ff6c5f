//! Time-range shard planning
//!
//! Breaks a time window into successive `[a, b)` steps, then widens each to
//! `[a - overlap, b + step_overlap)` where `overlap` is `start_overlap` for
//! the first shard and `step_overlap` otherwise. The widening compensates
//! for server-side timestamp imprecision; it is also what makes cross-shard
//! dedup necessary downstream.

use chrono::{DateTime, Duration, Utc};

/// One half-open time range, processed in parallel with its peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    /// Widened range start (inclusive)
    pub from: DateTime<Utc>,
    /// Widened range end (exclusive)
    pub to: DateTime<Utc>,
    /// Unwidened step start
    pub base_from: DateTime<Utc>,
    /// Unwidened step end; equals the next shard's `base_from`
    pub base_to: DateTime<Utc>,
    /// Position in generation order
    pub index: usize,
    /// Whether this is the final shard of the plan
    pub is_last: bool,
}

impl Shard {
    /// Identity used in logs and slice-failure accounting
    pub fn id(&self) -> String {
        format!(
            "{}..{}",
            self.base_from.format("%Y-%m-%dT%H:%M:%SZ"),
            self.base_to.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Plan overlapping shards covering `[from, to)`
pub fn plan(
    from: DateTime<Utc>,
    to: Option<DateTime<Utc>>,
    step: Duration,
    step_overlap: Duration,
    start_overlap: Option<Duration>,
) -> Vec<Shard> {
    let to = to.unwrap_or_else(Utc::now);
    let mut shards = Vec::new();
    let mut a = from;

    while a < to {
        let b = a + step;
        let overlap = if shards.is_empty() {
            start_overlap.unwrap_or(step_overlap)
        } else {
            step_overlap
        };
        shards.push(Shard {
            from: a - overlap,
            to: b + step_overlap,
            base_from: a,
            base_to: b,
            index: shards.len(),
            is_last: false,
        });
        a = b;
    }

    if let Some(last) = shards.last_mut() {
        last.is_last = true;
    }
    shards
}
