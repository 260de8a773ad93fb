//! Distributed Tier - shared key/value service
//!
//! The only tier shared between processes. It is optional and must never make
//! the cache fail: every remote error is logged and degrades to a miss (reads)
//! or a no-op (writes).
//!
//! # Connection lifecycle
//!
//! - Connect lazily on first use and cache the session
//! - A failed operation drops the cached session; the next call reconnects
//! - Every connect attempt is bounded by `connect_timeout`
//! - While one caller is reconnecting, reads skip the tier; writes, deletes
//!   and clears wait for that connect, for at most `connect_timeout`
//!
//! # Key namespace
//!
//! Every key is stored under `namespace`, so the tier can share a server with
//! other applications and `clear(None)` only touches this cache's keys.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::compression::{CompressionConfig, CompressionManager};
use super::entry::{decode_record, encode_record, CacheEntry};
use super::tier::{CacheTier, TierKind};
use crate::clock::{system_clock, SharedClock};
use crate::error::{Error, Result};

/// Prefix for every key this tier writes
pub const DEFAULT_NAMESPACE: &str = "stratum:";

/// Distributed tier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DistributedTierConfig {
    /// Service endpoint (informational for custom stores)
    pub endpoint: String,
    /// Prepended to every remote key; bounds what `clear` may remove
    pub namespace: String,
    /// Upper bound on one connect attempt
    pub connect_timeout: Duration,
    /// Record payload compression
    pub compression: CompressionConfig,
}

impl Default for DistributedTierConfig {
    fn default() -> Self {
        Self {
            endpoint: "redis://127.0.0.1:6379".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            connect_timeout: Duration::from_millis(250),
            compression: CompressionConfig::default(),
        }
    }
}

// =============================================================================
// Remote Store Ports
// =============================================================================

/// Opens sessions to a remote key/value service
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Establish a new session
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>>;

    /// Endpoint description for logs
    fn describe(&self) -> String;
}

/// An established session. Sessions are shared between concurrent callers.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Fetch raw bytes
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store raw bytes with a server-side time-to-live
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Remove a key
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove all keys, or those starting with `prefix`
    async fn clear(&self, prefix: Option<&str>) -> Result<usize>;

    /// Whether the session may still be used
    fn is_valid(&self) -> bool {
        true
    }
}

// =============================================================================
// Distributed Tier
// =============================================================================

/// What a caller does when another caller is already connecting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Skip the tier; a miss is harmless
    Read,
    /// Wait for the connect; a skipped write or delete would leave stale data
    Write,
}

/// Distributed tier over any [`RemoteStore`]
pub struct DistributedTier {
    store: Arc<dyn RemoteStore>,
    session: Mutex<Option<Arc<dyn RemoteSession>>>,
    connecting: tokio::sync::Mutex<()>,
    config: DistributedTierConfig,
    compression: CompressionManager,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    connects: AtomicU64,
}

impl DistributedTier {
    /// Create a tier over the given store
    pub fn new(store: Arc<dyn RemoteStore>, config: DistributedTierConfig) -> Self {
        Self::with_clock(store, config, system_clock())
    }

    /// Create with an explicit clock
    pub fn with_clock(
        store: Arc<dyn RemoteStore>,
        config: DistributedTierConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            session: Mutex::new(None),
            connecting: tokio::sync::Mutex::new(()),
            compression: CompressionManager::with_config(config.compression.clone()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }

    fn cached_session(&self) -> Option<Arc<dyn RemoteSession>> {
        let guard = self.session.lock();
        guard.as_ref().filter(|s| s.is_valid()).cloned()
    }

    /// Return a usable session, connecting if needed. `None` means the tier
    /// is unavailable for this call.
    async fn session(&self, access: Access) -> Option<Arc<dyn RemoteSession>> {
        if let Some(session) = self.cached_session() {
            return Some(session);
        }

        let _gate = match access {
            Access::Read => match self.connecting.try_lock() {
                Ok(gate) => gate,
                Err(_) => {
                    debug!(store = %self.store.describe(), "Reconnect in progress, skipping distributed read");
                    return None;
                }
            },
            Access::Write => {
                match tokio::time::timeout(self.config.connect_timeout, self.connecting.lock()).await {
                    Ok(gate) => gate,
                    Err(_) => {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            store = %self.store.describe(),
                            timeout = ?self.config.connect_timeout,
                            "Gave up waiting for distributed reconnect"
                        );
                        return None;
                    }
                }
            }
        };

        if let Some(session) = self.cached_session() {
            return Some(session);
        }

        match tokio::time::timeout(self.config.connect_timeout, self.store.connect()).await {
            Ok(Ok(session)) => {
                self.connects.fetch_add(1, Ordering::Relaxed);
                info!(store = %self.store.describe(), "Distributed tier connected");
                *self.session.lock() = Some(session.clone());
                Some(session)
            }
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(store = %self.store.describe(), error = %e, "Distributed tier connect failed");
                None
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    store = %self.store.describe(),
                    timeout = ?self.config.connect_timeout,
                    "Distributed tier connect timed out"
                );
                None
            }
        }
    }

    /// Drop the cached session after an operation on `failed` went wrong.
    /// A newer session installed in the meantime is kept.
    fn mark_failed(&self, op: &str, err: &Error, failed: &Arc<dyn RemoteSession>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        {
            let mut cached = self.session.lock();
            if cached.as_ref().is_some_and(|s| Arc::ptr_eq(s, failed)) {
                *cached = None;
            }
        }
        warn!(op, error = %err, "Distributed tier operation failed, treating as miss");
    }

    fn remote_key(&self, key: &str) -> String {
        format!("{}{}", self.config.namespace, key)
    }

    /// Whether a session is currently cached
    pub fn is_connected(&self) -> bool {
        self.cached_session().is_some()
    }

    /// Get tier statistics
    pub fn stats(&self) -> DistributedTierStats {
        DistributedTierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
        }
    }

    fn miss(&self) -> Result<Option<CacheEntry>> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

/// Distributed tier statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedTierStats {
    /// Hit count
    pub hits: u64,
    /// Miss count (including misses caused by failures)
    pub misses: u64,
    /// Failed connects and operations
    pub failures: u64,
    /// Successful connects
    pub connects: u64,
}

#[async_trait]
impl CacheTier for DistributedTier {
    fn kind(&self) -> TierKind {
        TierKind::Distributed
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let Some(session) = self.session(Access::Read).await else {
            return self.miss();
        };
        let remote_key = self.remote_key(key);

        let raw = match session.get(&remote_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.miss(),
            Err(e) => {
                self.mark_failed("get", &e, &session);
                return self.miss();
            }
        };

        match decode_record(&raw, &self.compression) {
            Ok((stored_key, entry)) if stored_key == key => {
                if entry.is_expired(self.clock.now_millis()) {
                    if let Err(e) = session.delete(&remote_key).await {
                        self.mark_failed("delete", &e, &session);
                    }
                    return self.miss();
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.served_by(TierKind::Distributed)))
            }
            Ok((stored_key, _)) => {
                warn!(key, stored_key, "Distributed record key mismatch");
                self.miss()
            }
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable distributed record");
                if let Err(e) = session.delete(&remote_key).await {
                    self.mark_failed("delete", &e, &session);
                }
                self.miss()
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let Some(ttl) = entry.remaining_ttl(self.clock.now_millis()) else {
            // The previous value must not outlive a rejected write
            self.delete(key).await?;
            return Ok(());
        };
        let Some(session) = self.session(Access::Write).await else {
            debug!(key, "Distributed tier unavailable, skipping write");
            return Ok(());
        };

        let record = encode_record(key, &entry, &self.compression);
        if let Err(e) = session.set(&self.remote_key(key), record, ttl).await {
            self.mark_failed("set", &e, &session);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let Some(session) = self.session(Access::Write).await else {
            return Ok(false);
        };
        match session.delete(&self.remote_key(key)).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                self.mark_failed("delete", &e, &session);
                Ok(false)
            }
        }
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<usize> {
        let Some(session) = self.session(Access::Write).await else {
            return Ok(0);
        };
        let pattern = self.remote_key(prefix.unwrap_or(""));
        match session.clear(Some(&pattern)).await {
            Ok(removed) => Ok(removed),
            Err(e) => {
                self.mark_failed("clear", &e, &session);
                Ok(0)
            }
        }
    }
}

// =============================================================================
// In-Memory Remote Store
// =============================================================================

struct SharedState {
    data: DashMap<String, (Bytes, u64)>,
    available: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicU64,
    operations: AtomicU64,
    clock: SharedClock,
}

/// Process-local stand-in for a remote key/value service.
///
/// Clones share the same data, so two orchestrators built over clones of one
/// store behave like two processes sharing a cache server. Availability can
/// be switched off to exercise failure handling.
#[derive(Clone)]
pub struct InMemoryRemoteStore {
    shared: Arc<SharedState>,
}

impl InMemoryRemoteStore {
    /// Create an empty, available store
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create with an explicit clock for server-side TTLs
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(SharedState {
                data: DashMap::new(),
                available: AtomicBool::new(true),
                connect_delay: Mutex::new(None),
                connects: AtomicU64::new(0),
                operations: AtomicU64::new(0),
                clock,
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`)
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Make every connect attempt take this long
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Successful connects so far
    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Session operations served so far
    pub fn operations(&self) -> u64 {
        self.shared.operations.load(Ordering::Relaxed)
    }

    /// Number of stored keys (including expired, not yet touched ones)
    pub fn len(&self) -> usize {
        self.shared.data.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.shared.data.is_empty()
    }

    /// Raw stored bytes, bypassing expiry
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.shared.data.get(key).map(|v| v.0.clone())
    }

    /// Store raw bytes directly, bypassing the tier
    pub fn put_raw(&self, key: &str, value: Bytes, ttl: Duration) {
        let expires_at = self
            .shared
            .clock
            .now_millis()
            .saturating_add(ttl.as_millis() as u64);
        self.shared.data.insert(key.to_string(), (value, expires_at));
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn connect(&self) -> Result<Arc<dyn RemoteSession>> {
        let delay = *self.shared.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(Error::unavailable("distributed", "connection refused"));
        }
        self.shared.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(InMemorySession {
            shared: self.shared.clone(),
        }))
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

struct InMemorySession {
    shared: Arc<SharedState>,
}

impl InMemorySession {
    fn check(&self) -> Result<()> {
        self.shared.operations.fetch_add(1, Ordering::Relaxed);
        if self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::unavailable("distributed", "connection reset"))
        }
    }
}

#[async_trait]
impl RemoteSession for InMemorySession {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check()?;
        let now = self.shared.clock.now_millis();
        let expired = match self.shared.data.get(key) {
            None => return Ok(None),
            Some(v) if v.1 > now => return Ok(Some(v.0.clone())),
            Some(_) => true,
        };
        if expired {
            self.shared.data.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.check()?;
        let expires_at = self
            .shared
            .clock
            .now_millis()
            .saturating_add(ttl.as_millis() as u64);
        self.shared.data.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.shared.data.remove(key).is_some())
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<usize> {
        self.check()?;
        let before = self.shared.data.len();
        match prefix {
            None => self.shared.data.clear(),
            Some(prefix) => self.shared.data.retain(|k, _| !k.starts_with(prefix)),
        }
        Ok(before.saturating_sub(self.shared.data.len()))
    }

    fn is_valid(&self) -> bool {
        self.shared.available.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================
