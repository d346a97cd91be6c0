//! Per-subdomain access counting, bucketed by time unit.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Access counts keyed by the bucket start time (truncated to the counter unit).
pub type AccessCount = HashMap<DateTime<Utc>, i64>;

/// A thread-safe access counter.
///
/// Every `add` lands in the bucket for the current time truncated to `unit`.
/// `collect` drains all buckets and re-seeds an empty bucket for the current
/// time, so a collector always observes at least one entry.
#[derive(Debug)]
pub struct AccessCounter {
    unit: TimeDelta,
    count: Mutex<AccessCount>,
}

impl AccessCounter {
    /// Create a counter with the given bucket unit. A zero unit falls back
    /// to one minute.
    pub fn new(unit: Duration) -> Self {
        let unit = if unit.is_zero() {
            TimeDelta::minutes(1)
        } else {
            TimeDelta::from_std(unit).unwrap_or_else(|_| TimeDelta::minutes(1))
        };
        let c = Self {
            unit,
            count: Mutex::new(AccessCount::with_capacity(2)),
        };
        c.count.lock().insert(c.bucket(), 0);
        c
    }

    fn bucket(&self) -> DateTime<Utc> {
        let now = Utc::now();
        now.duration_trunc(self.unit).unwrap_or(now)
    }

    /// Record one access in the current bucket.
    pub fn add(&self) {
        let bucket = self.bucket();
        let mut count = self.count.lock();
        *count.entry(bucket).or_insert(0) += 1;
    }

    /// Drain all buckets, returning them to the caller, and seed a fresh
    /// zero bucket for the current time.
    pub fn collect(&self) -> AccessCount {
        let bucket = self.bucket();
        let mut count = self.count.lock();
        let drained = std::mem::take(&mut *count);
        count.insert(bucket, 0);
        drained
    }
}
