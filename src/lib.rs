//! Stratum - Layered Cache and Bounded Resource Pool
//!
//! Read-through caching across a process-local memory tier, an optional
//! shared key/value tier and an on-disk tier, plus a bounded pool for the
//! backend handles the cached producers use.
//!
//! # Architecture
//!
//! ```text
//!   request ──► CacheOrchestrator ──► Memory ─► Distributed ─► Durable
//!                      │ miss
//!                      ▼
//!                  producer ──► ResourcePool ──► backend (database, API...)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, record codec and the orchestrator
//! - [`pool`] - Bounded resource pool with FIFO waiting
//! - [`config`] - `CoreConfig` and per-component settings
//! - [`maintenance`] - Background expiry sweep and pool health checks
//! - [`clock`] - Wall-clock abstraction used for expiry
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use stratum::{cache_key, CacheOrchestrator, CoreConfig};
//!
//! # async fn demo() -> stratum::Result<()> {
//! let cache = CacheOrchestrator::from_config(&CoreConfig::default())?;
//! let key = cache_key("article", &["42", "comments"]);
//!
//! let comments: Vec<String> = cache
//!     .get_with(&key, Some(Duration::from_secs(60)), || async {
//!         Ok::<_, stratum::Error>(vec!["first!".to_string()])
//!     })
//!     .await?;
//! # let _ = comments;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod maintenance;
pub mod pool;

// Re-export commonly used types
pub use cache::{
    cache_key, hashed_key, CacheEntry, CacheOrchestrator, CacheTier, DistributedTier,
    DurableTier, InMemoryRemoteStore, MemoryTier, OrchestratorBuilder, RemoteStore, TierKind,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::CoreConfig;
pub use error::{Error, Result};
pub use maintenance::{Janitor, Maintenance};
pub use pool::{HandleManager, PoolConfig, PoolStatus, Pooled, ResourcePool};
