//! Per-stream counters
//!
//! Lock-free counters updated on the hot path, snapshotted for logging and
//! the shutdown summary.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one replication stream.
#[derive(Debug, Default)]
pub struct StreamCounters {
    events_received: AtomicU64,
    events_applied: AtomicU64,
    events_conflicted: AtomicU64,
    events_skipped: AtomicU64,
    retries: AtomicU64,
    errors: AtomicU64,
}

impl StreamCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflicted(&self) {
        self.events_conflicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.events_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_conflicted: self.events_conflicted.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`StreamCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub events_received: u64,
    pub events_applied: u64,
    pub events_conflicted: u64,
    pub events_skipped: u64,
    pub retries: u64,
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = StreamCounters::new();
        counters.record_received();
        counters.record_received();
        counters.record_applied();
        counters.record_conflicted();
        counters.record_skipped();
        counters.record_retry();
        counters.record_error();

        let snap = counters.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.events_applied, 1);
        assert_eq!(snap.events_conflicted, 1);
        assert_eq!(snap.events_skipped, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let counters = StreamCounters::new();
        counters.record_applied();
        let json = serde_json::to_string(&counters.snapshot()).unwrap();
        assert!(json.contains("\"events_applied\":1"));
    }
}
