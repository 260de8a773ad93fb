//! Memory Tier - process-local hot cache
//!
//! Bounded by a byte budget with least-recently-used batch eviction.
//!
//! # Design
//!
//! - One mutex over the map, the byte counter and the recency clock
//! - Recency is a monotonically increasing tick bumped on every hit
//! - When an insert would overflow the budget, the least recently used
//!   ~30% of entries are evicted in one pass (expired entries go first),
//!   repeated until the new entry fits

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::entry::CacheEntry;
use super::tier::{CacheTier, TierKind};
use super::DEFAULT_EVICTION_FRACTION;
use crate::clock::{system_clock, SharedClock};
use crate::config::DEFAULT_MEMORY_BYTE_BUDGET;
use crate::error::Result;

/// Memory tier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryTierConfig {
    /// Maximum payload bytes held
    pub byte_budget: u64,
    /// Share of entries evicted per batch
    pub eviction_fraction: f64,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            byte_budget: DEFAULT_MEMORY_BYTE_BUDGET,
            eviction_fraction: DEFAULT_EVICTION_FRACTION,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    last_access: u64,
}

#[derive(Default)]
struct Inner {
    map: HashMap<String, Slot>,
    used_bytes: u64,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.map.remove(key)?;
        self.used_bytes -= slot.entry.size_bytes();
        Some(slot)
    }
}

/// Memory tier - byte-bounded LRU
pub struct MemoryTier {
    inner: Mutex<Inner>,
    config: MemoryTierConfig,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MemoryTier {
    /// Create a new memory tier with default configuration
    pub fn new() -> Self {
        Self::with_config(MemoryTierConfig::default())
    }

    /// Create a new memory tier with custom configuration
    pub fn with_config(config: MemoryTierConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create with an explicit clock
    pub fn with_clock(config: MemoryTierConfig, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a live entry and mark it most recently used
    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();

        let expired = match inner.map.get(key) {
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Some(slot) => slot.entry.is_expired(now),
        };

        if expired {
            inner.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = inner.next_tick();
        let slot = inner.map.get_mut(key)?;
        slot.last_access = tick;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(slot.entry.clone().served_by(TierKind::Memory))
    }

    /// Insert an entry; returns false when it cannot be held at all
    pub fn insert(&self, key: &str, entry: CacheEntry) -> bool {
        let size = entry.size_bytes();
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();

        // A replaced value must not survive a rejected write
        inner.remove(key);

        if entry.is_expired(now) {
            return false;
        }
        if size > self.config.byte_budget {
            debug!(key, size, budget = self.config.byte_budget, "Entry exceeds memory budget");
            return false;
        }

        while inner.used_bytes + size > self.config.byte_budget && !inner.map.is_empty() {
            self.evict_batch(&mut inner, now);
        }

        let tick = inner.next_tick();
        inner.used_bytes += size;
        inner.map.insert(
            key.to_string(),
            Slot {
                entry,
                last_access: tick,
            },
        );
        true
    }

    /// Remove one key
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove all keys, or those starting with `prefix`
    pub fn clear_prefix(&self, prefix: Option<&str>) -> usize {
        let mut inner = self.inner.lock();
        match prefix {
            None => {
                let removed = inner.map.len();
                inner.map.clear();
                inner.used_bytes = 0;
                removed
            }
            Some(prefix) => {
                let keys: Vec<String> = inner
                    .map
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect();
                for key in &keys {
                    inner.remove(key);
                }
                keys.len()
            }
        }
    }

    /// Drop every expired entry
    pub fn purge(&self) -> usize {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Evict the least recently used share of entries in one pass
    fn evict_batch(&self, inner: &mut Inner, now: u64) {
        let batch = ((inner.map.len() as f64 * self.config.eviction_fraction).ceil() as usize)
            .clamp(1, inner.map.len());

        let mut candidates: Vec<(bool, u64, String)> = inner
            .map
            .iter()
            .map(|(k, slot)| (!slot.entry.is_expired(now), slot.last_access, k.clone()))
            .collect();
        // Expired (false) sorts before live, then oldest access first
        candidates.sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in candidates.into_iter().take(batch) {
            inner.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        debug!(batch, remaining = inner.map.len(), "Memory tier evicted batch");
    }

    /// Check if a live entry exists without touching recency
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        self.inner
            .lock()
            .map
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired(now))
    }

    /// Number of entries held (including not-yet-purged expired ones)
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently accounted
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    /// Configured budget
    pub fn byte_budget(&self) -> u64 {
        self.config.byte_budget
    }

    /// Get cache statistics
    pub fn stats(&self) -> MemoryTierStats {
        let (entries, used_bytes) = {
            let inner = self.inner.lock();
            (inner.map.len(), inner.used_bytes)
        };
        MemoryTierStats {
            entries,
            used_bytes,
            byte_budget: self.config.byte_budget,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory tier statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryTierStats {
    /// Number of entries
    pub entries: usize,
    /// Bytes in use
    pub used_bytes: u64,
    /// Byte budget
    pub byte_budget: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Entries evicted for space
    pub evictions: u64,
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn kind(&self) -> TierKind {
        TierKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.lookup(key))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        self.insert(key, entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.remove(key))
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<usize> {
        Ok(self.clear_prefix(prefix))
    }

    async fn purge_expired(&self) -> Result<usize> {
        Ok(self.purge())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    fn tier(budget: u64) -> (MemoryTier, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = MemoryTierConfig {
            byte_budget: budget,
            ..Default::default()
        };
        (MemoryTier::with_clock(config, clock.clone()), clock)
    }

    fn entry(clock: &ManualClock, size: usize, ttl: Duration) -> CacheEntry {
        use crate::clock::Clock;
        CacheEntry::with_ttl(Bytes::from(vec![7u8; size]), ttl, clock.now_millis())
    }

    #[test]
    fn test_insert_and_lookup() {
        let (cache, clock) = tier(1024);
        assert!(cache.insert("avatar:1", entry(&clock, 10, HOUR)));

        let hit = cache.lookup("avatar:1").unwrap();
        assert_eq!(hit.size_bytes(), 10);
        assert_eq!(hit.tier_origin(), Some(TierKind::Memory));
        assert_eq!(cache.used_bytes(), 10);
        assert!(cache.lookup("avatar:2").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_budget_scenario_evicts_two_oldest() {
        let (cache, clock) = tier(1000);
        for i in 0..5 {
            assert!(cache.insert(&format!("k{}", i), entry(&clock, 300, HOUR)));
        }

        assert_eq!(cache.len(), 3);
        assert!(cache.used_bytes() <= 1000);
        assert!(!cache.contains("k0"));
        assert!(!cache.contains("k1"));
        assert!(cache.contains("k2") && cache.contains("k3") && cache.contains("k4"));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_lookup_refreshes_recency() {
        let (cache, clock) = tier(1000);
        for i in 0..3 {
            cache.insert(&format!("k{}", i), entry(&clock, 300, HOUR));
        }
        // k0 becomes the most recently used
        assert!(cache.lookup("k0").is_some());

        cache.insert("k3", entry(&clock, 300, HOUR));
        assert!(cache.contains("k0"));
        assert!(!cache.contains("k1"));
    }

    #[test]
    fn test_batch_eviction_takes_thirty_percent() {
        let (cache, clock) = tier(1000);
        for i in 0..10 {
            cache.insert(&format!("k{}", i), entry(&clock, 100, HOUR));
        }
        assert_eq!(cache.len(), 10);

        // Overflow by one byte: one batch of ceil(10 * 0.3) = 3 entries goes
        cache.insert("big", entry(&clock, 1, HOUR));
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.stats().evictions, 3);
        assert!(!cache.contains("k0") && !cache.contains("k1") && !cache.contains("k2"));
    }

    #[test]
    fn test_expired_entries_evicted_first() {
        let (cache, clock) = tier(1000);
        cache.insert("live-old", entry(&clock, 300, HOUR));
        cache.insert("short", entry(&clock, 300, Duration::from_secs(1)));
        cache.insert("live-new", entry(&clock, 300, HOUR));

        clock.advance(Duration::from_secs(2));
        cache.insert("incoming", entry(&clock, 300, HOUR));

        assert!(cache.contains("live-old"));
        assert!(cache.contains("live-new"));
        assert!(cache.contains("incoming"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_expired_lookup_is_a_miss_and_removes() {
        let (cache, clock) = tier(1000);
        cache.insert("k", entry(&clock, 10, Duration::from_secs(5)));

        clock.advance(Duration::from_secs(5));
        assert!(cache.lookup("k").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_oversized_entry_rejected_and_replaces_nothing() {
        let (cache, clock) = tier(100);
        cache.insert("k", entry(&clock, 10, HOUR));
        assert!(!cache.insert("k", entry(&clock, 101, HOUR)));
        // The stale value is gone rather than served
        assert!(!cache.contains("k"));
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn test_replace_updates_accounting() {
        let (cache, clock) = tier(1000);
        cache.insert("k", entry(&clock, 100, HOUR));
        cache.insert("k", entry(&clock, 40, HOUR));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.used_bytes(), 40);
    }

    #[test]
    fn test_clear_with_prefix() {
        let (cache, clock) = tier(10_000);
        cache.insert("article:42:body", entry(&clock, 10, HOUR));
        cache.insert("article:42:comments", entry(&clock, 10, HOUR));
        cache.insert("article:43:body", entry(&clock, 10, HOUR));

        assert_eq!(cache.clear_prefix(Some("article:42:")), 2);
        assert!(cache.contains("article:43:body"));
        assert_eq!(cache.used_bytes(), 10);

        assert_eq!(cache.clear_prefix(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_drops_only_expired() {
        let (cache, clock) = tier(10_000);
        cache.insert("a", entry(&clock, 10, Duration::from_secs(1)));
        cache.insert("b", entry(&clock, 10, HOUR));
        clock.advance(Duration::from_secs(1));

        assert_eq!(cache.purge(), 1);
        assert!(cache.contains("b"));
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let cache = Arc::new(MemoryTier::with_config(MemoryTierConfig {
            byte_budget: 64 * 1024,
            ..Default::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("obj-{}-{}", t, i);
                        let entry = CacheEntry::with_ttl(
                            Bytes::from(vec![i as u8; 64]),
                            HOUR,
                            crate::clock::Clock::now_millis(&crate::clock::SystemClock),
                        );
                        cache.insert(&key, entry);
                        cache.lookup(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(cache.used_bytes() <= 64 * 1024);
    }

    proptest::proptest! {
        #[test]
        fn prop_budget_never_exceeded(sizes in proptest::collection::vec(0usize..400, 1..60)) {
            let (cache, clock) = tier(1000);
            for (i, size) in sizes.iter().enumerate() {
                cache.insert(&format!("k{}", i % 17), entry(&clock, *size, HOUR));
                proptest::prop_assert!(cache.used_bytes() <= 1000);
            }
            let summed: u64 = (0..17)
                .filter_map(|i| cache.lookup(&format!("k{}", i)))
                .map(|e| e.size_bytes())
                .sum();
            proptest::prop_assert_eq!(summed, cache.used_bytes());
        }
    }
}
