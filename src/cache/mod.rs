//! Layered Cache
//!
//! Three tiers behind one orchestrator:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    CacheOrchestrator                       │
//! │        get / get_with / set / delete / clear / purge       │
//! └──────────────┬──────────────────┬──────────────────┬───────┘
//!                │                  │                  │
//!        ┌───────▼──────┐   ┌───────▼───────┐  ┌───────▼───────┐
//!        │  MemoryTier  │   │DistributedTier│  │  DurableTier  │
//!        │ byte-bounded │   │ shared k/v,   │  │ file/record,  │
//!        │ LRU, local   │   │ optional      │  │ survives exit │
//!        └──────────────┘   └───────────────┘  └───────────────┘
//! ```
//!
//! Values are JSON-serialized once by the orchestrator; tiers only move
//! bytes with an absolute expiry.

pub mod compression;
pub mod distributed;
pub mod durable;
pub mod entry;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod tier;

pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
pub use distributed::{
    DistributedTier, DistributedTierConfig, DistributedTierStats, InMemoryRemoteStore,
    RemoteSession, RemoteStore, DEFAULT_NAMESPACE,
};
pub use durable::{DurableTier, DurableTierConfig, DurableTierStats};
pub use entry::{cache_key, hashed_key, CacheEntry};
pub use memory::{MemoryTier, MemoryTierConfig, MemoryTierStats};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use orchestrator::{CacheOrchestrator, OrchestratorBuilder, OrchestratorConfig};
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;
pub use tier::{CacheTier, TierKind};

/// Share of memory-tier entries evicted per batch
pub const DEFAULT_EVICTION_FRACTION: f64 = 0.3;
