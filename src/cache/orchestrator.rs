//! Cache Orchestrator
//!
//! Coordinates the tiers behind one read-through API.
//!
//! # Read path
//!
//! ```text
//! get_with(key) ──► Memory ──miss──► Distributed ──miss──► Durable ──miss──► producer
//!                     ▲                  │                   │                 │
//!                     └──── backfill ────┴───── backfill ────┘   write-through ┘
//! ```
//!
//! A hit in a slower tier refills every faster tier with the same absolute
//! expiry. A full miss runs the producer once and writes the value through.
//! Tier failures are logged and skipped; only the producer's own error ever
//! reaches the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use super::distributed::{DistributedTier, RemoteStore};
use super::durable::DurableTier;
use super::entry::CacheEntry;
use super::memory::MemoryTier;
use super::metrics::{CacheMetrics, LatencyTracker};
use super::tier::{CacheTier, TierKind};
use crate::clock::{system_clock, SharedClock};
use crate::config::{CoreConfig, DEFAULT_TTL_SECONDS};
use crate::error::{Error, Result};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// TTL applied when a caller passes `None`
    pub default_ttl: Duration,
    /// Coalesce concurrent misses on the same key into one producer run
    pub single_flight: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECONDS),
            single_flight: true,
        }
    }
}

/// Layered read-through cache
pub struct CacheOrchestrator {
    /// Fastest first
    tiers: Vec<Box<dyn CacheTier>>,
    config: OrchestratorConfig,
    clock: SharedClock,
    /// Per-key gates for single-flight
    in_flight: FlightMap,
    metrics: Arc<CacheMetrics>,
}

impl CacheOrchestrator {
    /// Start building an orchestrator from explicit tiers
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Build the standard tier stack from configuration.
    ///
    /// The distributed tier uses Redis when the `redis` feature is enabled;
    /// otherwise enabling it is a configuration error.
    pub fn from_config(config: &CoreConfig) -> Result<Self> {
        let remote: Option<Arc<dyn RemoteStore>> = if config.distributed_enabled {
            Some(default_remote_store(&config.distributed_endpoint)?)
        } else {
            None
        };
        Self::from_config_with_remote(config, remote)
    }

    /// Build the standard tier stack with a caller-supplied remote store
    pub fn from_config_with_remote(
        config: &CoreConfig,
        remote: Option<Arc<dyn RemoteStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let clock = system_clock();

        let mut builder = Self::builder()
            .config(config.orchestrator())
            .clock(clock.clone())
            .tier(MemoryTier::with_clock(config.memory_tier(), clock.clone()));

        if config.distributed_enabled {
            let remote = remote.ok_or_else(|| {
                Error::Config("distributed tier enabled without a remote store".into())
            })?;
            builder = builder.tier(DistributedTier::with_clock(
                remote,
                config.distributed_tier(),
                clock.clone(),
            ));
        }

        builder = builder.tier(DurableTier::with_clock(config.durable_tier(), clock));
        Ok(builder.build())
    }

    /// Tier kinds, fastest first
    pub fn tier_kinds(&self) -> Vec<TierKind> {
        self.tiers.iter().map(|t| t.kind()).collect()
    }

    /// Get configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Get metrics
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Keys with a producer run in progress or waiters queued
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Look up a value without a producer. `Ok(None)` is a miss.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let value = self.probe(key).await;
        if value.is_none() {
            self.metrics.record_miss();
        }
        Ok(value)
    }

    /// Read-through lookup: on a miss in every tier, run `producer`, cache its
    /// value for `ttl` (or the default TTL) and return it.
    ///
    /// A producer error is returned unchanged and nothing is cached.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_with<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.probe(key).await {
            return Ok(value);
        }
        self.metrics.record_miss();

        if !self.config.single_flight {
            return self.produce(key, ttl, producer).await;
        }

        let flight = FlightGate::join(&self.in_flight, key);
        let _turn = flight.gate.lock().await;
        // Whoever held the gate before us may have stored the value
        match self.probe(key).await {
            Some(value) => {
                self.metrics.record_coalesced();
                Ok(value)
            }
            None => self.produce(key, ttl, producer).await,
        }
    }

    /// Probe tiers in order, backfilling faster tiers on a slower hit
    async fn probe<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let (index, entry) = self.find(key).await?;

        match serde_json::from_slice::<T>(entry.value()) {
            Ok(value) => {
                if index > 0 {
                    self.backfill(index, key, &entry).await;
                }
                Some(value)
            }
            Err(e) => {
                self.metrics.record_decode_failure();
                warn!(key, tier = %self.tiers[index].kind(), error = %e, "Cached value failed to decode, dropping it");
                self.delete_everywhere(key).await;
                None
            }
        }
    }

    async fn find(&self, key: &str) -> Option<(usize, CacheEntry)> {
        for (index, tier) in self.tiers.iter().enumerate() {
            let tracker = LatencyTracker::start();
            match tier.get(key).await {
                Ok(Some(entry)) => {
                    self.metrics.record_read_latency(tier.kind(), tracker.elapsed());
                    self.metrics.record_hit(tier.kind());
                    debug!(key, tier = %tier.kind(), "Cache hit");
                    return Some((index, entry));
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.record_tier_error(tier.kind());
                    warn!(key, tier = %tier.kind(), error = %e, "Tier read failed, falling through");
                }
            }
        }
        None
    }

    /// Copy a hit into every tier faster than the one that served it. The
    /// entry keeps its absolute expiry.
    async fn backfill(&self, hit_index: usize, key: &str, entry: &CacheEntry) {
        let mut filled = 0;
        for tier in &self.tiers[..hit_index] {
            match tier.set(key, entry.clone()).await {
                Ok(()) => filled += 1,
                Err(e) => {
                    self.metrics.record_tier_error(tier.kind());
                    warn!(key, tier = %tier.kind(), error = %e, "Backfill failed");
                }
            }
        }
        self.metrics.record_backfill(filled);
    }

    async fn produce<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        producer: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.metrics.record_producer_call();
        let value = match producer().await {
            Ok(value) => value,
            Err(e) => {
                self.metrics.record_producer_failure();
                debug!(key, "Producer failed, nothing cached");
                return Err(e);
            }
        };

        match serde_json::to_vec(&value) {
            Ok(encoded) => {
                self.write_through(key, Bytes::from(encoded), ttl.unwrap_or(self.config.default_ttl))
                    .await
            }
            Err(e) => warn!(key, error = %e, "Produced value is not serializable, returning it uncached"),
        }
        Ok(value)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a value through to every tier. `ttl = None` uses the default TTL;
    /// a zero TTL removes the key instead.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        if ttl.is_zero() {
            self.delete_everywhere(key).await;
            return Ok(());
        }
        self.write_through(key, Bytes::from(encoded), ttl).await;
        Ok(())
    }

    async fn write_through(&self, key: &str, encoded: Bytes, ttl: Duration) {
        if ttl.is_zero() {
            debug!(key, "Zero TTL, value not cached");
            return;
        }

        let entry = CacheEntry::with_ttl(encoded, ttl, self.clock.now_millis());
        let results = join_all(self.tiers.iter().map(|tier| tier.set(key, entry.clone()))).await;
        for (tier, result) in self.tiers.iter().zip(results) {
            if let Err(e) = result {
                self.metrics.record_tier_error(tier.kind());
                warn!(key, tier = %tier.kind(), error = %e, "Tier write failed");
            }
        }
        self.metrics.record_write();
    }

    /// Remove a key from every tier; true when any tier held it
    #[instrument(skip_all, fields(key = %key))]
    pub async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.delete_everywhere(key).await)
    }

    async fn delete_everywhere(&self, key: &str) -> bool {
        let mut removed = false;
        let results = join_all(self.tiers.iter().map(|tier| tier.delete(key))).await;
        for (tier, result) in self.tiers.iter().zip(results) {
            match result {
                Ok(hit) => removed |= hit,
                Err(e) => {
                    self.metrics.record_tier_error(tier.kind());
                    warn!(key, tier = %tier.kind(), error = %e, "Tier delete failed");
                }
            }
        }
        self.metrics.record_delete();
        removed
    }

    /// Remove every key, or every key starting with `prefix`, from all
    /// tiers. Returns the number of records removed summed over tiers.
    #[instrument(skip(self))]
    pub async fn clear(&self, prefix: Option<&str>) -> Result<usize> {
        let mut removed = 0;
        for tier in &self.tiers {
            match tier.clear(prefix).await {
                Ok(n) => {
                    debug!(tier = %tier.kind(), removed = n, "Tier cleared");
                    removed += n;
                }
                Err(e) => {
                    self.metrics.record_tier_error(tier.kind());
                    warn!(tier = %tier.kind(), error = %e, "Tier clear failed");
                }
            }
        }
        Ok(removed)
    }

    /// Drop expired entries from every tier that supports eager purging
    pub async fn purge_expired(&self) -> Result<usize> {
        let mut purged = 0;
        for tier in &self.tiers {
            match tier.purge_expired().await {
                Ok(n) => purged += n,
                Err(e) => {
                    self.metrics.record_tier_error(tier.kind());
                    warn!(tier = %tier.kind(), error = %e, "Tier purge failed");
                }
            }
        }
        if purged > 0 {
            debug!(purged, "Expired entries purged");
        }
        Ok(purged)
    }
}

#[cfg(feature = "redis")]
fn default_remote_store(endpoint: &str) -> Result<Arc<dyn RemoteStore>> {
    Ok(Arc::new(super::redis_store::RedisStore::open(endpoint)?))
}

#[cfg(not(feature = "redis"))]
fn default_remote_store(endpoint: &str) -> Result<Arc<dyn RemoteStore>> {
    Err(Error::Config(format!(
        "distributed tier ({}) requires the `redis` feature",
        endpoint
    )))
}

// =============================================================================
// Single-Flight Gate
// =============================================================================

type FlightMap = DashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// A caller's share of a per-key gate. The last one out removes the gate,
/// including when the lookup is cancelled mid-wait.
struct FlightGate<'a> {
    in_flight: &'a FlightMap,
    key: &'a str,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> FlightGate<'a> {
    fn join(in_flight: &'a FlightMap, key: &'a str) -> Self {
        let gate = in_flight.entry(key.to_string()).or_default().clone();
        Self {
            in_flight,
            key,
            gate,
        }
    }
}

impl Drop for FlightGate<'_> {
    fn drop(&mut self) {
        // Only the map and this share left; joins clone under the shard lock
        self.in_flight.remove_if(self.key, |_, gate| {
            Arc::ptr_eq(gate, &self.gate) && Arc::strong_count(gate) == 2
        });
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles an orchestrator from explicit tiers
pub struct OrchestratorBuilder {
    tiers: Vec<Box<dyn CacheTier>>,
    config: OrchestratorConfig,
    clock: SharedClock,
}

impl OrchestratorBuilder {
    /// Empty builder with default configuration
    pub fn new() -> Self {
        Self {
            tiers: Vec::new(),
            config: OrchestratorConfig::default(),
            clock: system_clock(),
        }
    }

    /// Append a tier. Tiers are probed in the order added.
    pub fn tier<T: CacheTier + 'static>(mut self, tier: T) -> Self {
        self.tiers.push(Box::new(tier));
        self
    }

    /// Append an already boxed tier
    pub fn boxed_tier(mut self, tier: Box<dyn CacheTier>) -> Self {
        self.tiers.push(tier);
        self
    }

    /// Replace the configuration
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    /// Enable or disable single-flight
    pub fn single_flight(mut self, enabled: bool) -> Self {
        self.config.single_flight = enabled;
        self
    }

    /// Clock used to stamp new entries
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> CacheOrchestrator {
        CacheOrchestrator {
            tiers: self.tiers,
            config: self.config,
            clock: self.clock,
            in_flight: DashMap::new(),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
