//! The interface every cache tier implements.
//!
//! The orchestrator holds an ordered list of `Box<dyn CacheTier>` (fastest
//! first) and never needs to know which concrete tier answered.

use async_trait::async_trait;

use super::entry::CacheEntry;
use crate::error::Result;

/// Which tier a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TierKind {
    /// Process-local memory
    Memory,
    /// Shared key/value service
    Distributed,
    /// On-disk records
    Durable,
}

impl TierKind {
    /// Get a short name for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            TierKind::Memory => "memory",
            TierKind::Distributed => "distributed",
            TierKind::Durable => "durable",
        }
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single cache backend in the fallback chain.
///
/// Entries carry an absolute expiry, so `set` needs no separate TTL and a
/// backfilled copy expires at the same instant as its source.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Tier identity
    fn kind(&self) -> TierKind;

    /// Look up a live entry. Expired entries are removed and reported as a
    /// miss.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous value
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    /// Remove a key; returns whether something was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Remove every key, or every key starting with `prefix`
    async fn clear(&self, prefix: Option<&str>) -> Result<usize>;

    /// Drop expired entries eagerly. Tiers that expire on their own keep the
    /// default.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}
