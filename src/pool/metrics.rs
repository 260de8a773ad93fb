//! Pool Metrics Collection

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Resource pool counters
#[derive(Debug, Default)]
pub struct PoolMetrics {
    acquired: AtomicU64,
    waits: AtomicU64,
    timeouts: AtomicU64,
    handoffs: AtomicU64,
    created: AtomicU64,
    create_failures: AtomicU64,
    validation_failures: AtomicU64,
    closed: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquire had to queue
    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A released handle went straight to a waiter
    pub fn record_handoff(&self) {
        self.handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_create_failure(&self) {
        self.create_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            handoffs: self.handoffs.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            create_failures: self.create_failures.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`PoolMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolMetricsSnapshot {
    pub acquired: u64,
    pub waits: u64,
    pub timeouts: u64,
    pub handoffs: u64,
    pub created: u64,
    pub create_failures: u64,
    pub validation_failures: u64,
    pub closed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let metrics = PoolMetrics::new();
        metrics.record_created();
        metrics.record_created();
        metrics.record_acquired();
        metrics.record_wait();
        metrics.record_timeout();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.created, 2);
        assert_eq!(snapshot.acquired, 1);
        assert_eq!(snapshot.waits, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.handoffs, 0);
    }
}
