//! Statistics tracking for the proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cache::Outcome;

/// How a query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Cached,
    Forwarded,
    /// Joined a fetch started by another query.
    Shared,
    /// Answered locally by policy.
    Synthesized,
    Failed,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Cached => "CACHED",
            Resolution::Forwarded => "FORWARDED",
            Resolution::Shared => "SHARED",
            Resolution::Synthesized => "SYNTHESIZED",
            Resolution::Failed => "FAILED",
        }
    }
}

impl From<Outcome> for Resolution {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Hit => Resolution::Cached,
            Outcome::Fetched => Resolution::Forwarded,
            Outcome::Joined => Resolution::Shared,
        }
    }
}

/// Atomic statistics for tracking proxy performance.
#[derive(Default)]
pub struct Stats {
    requests: AtomicU64,
    cached: AtomicU64,
    forwarded: AtomicU64,
    shared: AtomicU64,
    synthesized: AtomicU64,
    failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, resolution: Resolution, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match resolution {
            Resolution::Cached => &self.cached,
            Resolution::Forwarded => &self.forwarded,
            Resolution::Shared => &self.shared,
            Resolution::Synthesized => &self.synthesized,
            Resolution::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_response_time_us
            .fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            cached: self.cached.swap(0, Ordering::Relaxed),
            forwarded: self.forwarded.swap(0, Ordering::Relaxed),
            shared: self.shared.swap(0, Ordering::Relaxed),
            synthesized: self.synthesized.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            avg_response_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cached: u64,
    pub forwarded: u64,
    pub shared: u64,
    pub synthesized: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}
