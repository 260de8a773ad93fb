//! Bounded Resource Pool
//!
//! Caps concurrent backend handles and queues callers fairly when the cap
//! is reached.
//!
//! ```text
//!   acquire ──► idle handle? ──yes──► Pooled
//!                   │no
//!                   ▼
//!            total < max? ──yes──► create ──► Pooled
//!                   │no
//!                   ▼
//!            FIFO ticket ──grant──► Pooled
//!                   │deadline
//!                   ▼
//!             AcquireTimeout
//! ```

mod bounded;
pub mod manager;
pub mod metrics;
pub mod resource;
mod waiter;

use std::time::Duration;

pub use bounded::{HealthReport, PoolStatus, Pooled, ResourcePool};
pub use manager::HandleManager;
pub use metrics::{PoolMetrics, PoolMetricsSnapshot};
pub use resource::{PooledResource, ResourceState};

/// Pool configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Upper bound on live handles
    pub max_handles: usize,
    /// Share of `max_handles` kept idle after release
    pub idle_fraction: f64,
    /// Timeout for [`ResourcePool::acquire_default`]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_handles: 10,
            idle_fraction: 0.5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Most handles kept idle: `floor(max_handles * idle_fraction)`, at
    /// least one
    pub fn max_idle(&self) -> usize {
        let limit = (self.max_handles as f64 * self.idle_fraction).floor() as usize;
        limit.clamp(1, self.max_handles.max(1))
    }
}
