//! Cache Metrics Collection
//!
//! Orchestrator-level counters: which tier answered, how often the producer
//! ran, how much backfill happened and how often tiers misbehaved.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::tier::TierKind;

const TIER_COUNT: usize = 3;

fn slot(tier: TierKind) -> usize {
    match tier {
        TierKind::Memory => 0,
        TierKind::Distributed => 1,
        TierKind::Durable => 2,
    }
}

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    tier_hits: [AtomicU64; TIER_COUNT],
    tier_errors: [AtomicU64; TIER_COUNT],
    // Read latency per tier (microseconds, exponential moving average)
    tier_read_latency_us: [AtomicU64; TIER_COUNT],

    misses: AtomicU64,
    backfills: AtomicU64,
    producer_calls: AtomicU64,
    producer_failures: AtomicU64,
    coalesced: AtomicU64,
    decode_failures: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, tier: TierKind) {
        self.tier_hits[slot(tier)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_error(&self, tier: TierKind) {
        self.tier_errors[slot(tier)].fetch_add(1, Ordering::Relaxed);
    }

    /// A lookup that no tier could answer
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of faster tiers refilled after a hit
    pub fn record_backfill(&self, tiers: u64) {
        self.backfills.fetch_add(tiers, Ordering::Relaxed);
    }

    pub fn record_producer_call(&self) {
        self.producer_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_producer_failure(&self) {
        self.producer_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller served by another caller's producer run
    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_latency(&self, tier: TierKind, duration: Duration) {
        update_latency_ema(&self.tier_read_latency_us[slot(tier)], duration);
    }

    pub fn hits(&self, tier: TierKind) -> u64 {
        self.tier_hits[slot(tier)].load(Ordering::Relaxed)
    }

    pub fn tier_errors(&self, tier: TierKind) -> u64 {
        self.tier_errors[slot(tier)].load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn producer_calls(&self) -> u64 {
        self.producer_calls.load(Ordering::Relaxed)
    }

    pub fn read_latency(&self, tier: TierKind) -> Duration {
        Duration::from_micros(self.tier_read_latency_us[slot(tier)].load(Ordering::Relaxed))
    }

    /// Hits in any tier over all lookups
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits: u64 = self.tier_hits.iter().map(|h| h.load(Ordering::Relaxed)).sum();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            memory_hits: self.hits(TierKind::Memory),
            distributed_hits: self.hits(TierKind::Distributed),
            durable_hits: self.hits(TierKind::Durable),
            misses: self.misses(),
            memory_errors: self.tier_errors(TierKind::Memory),
            distributed_errors: self.tier_errors(TierKind::Distributed),
            durable_errors: self.tier_errors(TierKind::Durable),
            memory_read_latency_us: self.read_latency(TierKind::Memory).as_micros() as u64,
            distributed_read_latency_us: self.read_latency(TierKind::Distributed).as_micros()
                as u64,
            durable_read_latency_us: self.read_latency(TierKind::Durable).as_micros() as u64,
            backfills: self.backfills.load(Ordering::Relaxed),
            producer_calls: self.producer_calls(),
            producer_failures: self.producer_failures.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in self
            .tier_hits
            .iter()
            .chain(self.tier_errors.iter())
            .chain(self.tier_read_latency_us.iter())
        {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in [
            &self.misses,
            &self.backfills,
            &self.producer_calls,
            &self.producer_failures,
            &self.coalesced,
            &self.decode_failures,
            &self.writes,
            &self.deletes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

fn update_latency_ema(target: &AtomicU64, duration: Duration) {
    let new_us = duration.as_micros() as u64;
    let alpha = 0.1; // EMA smoothing factor

    loop {
        let current = target.load(Ordering::Relaxed);
        let updated = if current == 0 {
            new_us
        } else {
            ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
        };

        if target
            .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub memory_hits: u64,
    pub distributed_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,

    pub memory_errors: u64,
    pub distributed_errors: u64,
    pub durable_errors: u64,

    pub memory_read_latency_us: u64,
    pub distributed_read_latency_us: u64,
    pub durable_read_latency_us: u64,

    pub backfills: u64,
    pub producer_calls: u64,
    pub producer_failures: u64,
    pub coalesced: u64,
    pub decode_failures: u64,
    pub writes: u64,
    pub deletes: u64,

    pub overall_hit_ratio: f64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
