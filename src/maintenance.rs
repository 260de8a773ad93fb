//! Background maintenance
//!
//! The janitor periodically sweeps expired cache entries and health-checks
//! idle pool handles. Both also happen lazily on the hot path; the sweep only
//! bounds how long dead data can linger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheOrchestrator;
use crate::error::Result;
use crate::pool::{HandleManager, ResourcePool};

/// Something the janitor can sweep
#[async_trait]
pub trait Maintenance: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    /// One maintenance pass; returns how many items were removed
    async fn sweep(&self) -> Result<usize>;
}

#[async_trait]
impl Maintenance for CacheOrchestrator {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn sweep(&self) -> Result<usize> {
        self.purge_expired().await
    }
}

#[async_trait]
impl<M: HandleManager> Maintenance for ResourcePool<M> {
    fn name(&self) -> &'static str {
        "pool"
    }

    async fn sweep(&self) -> Result<usize> {
        Ok(self.health_check().await.closed)
    }
}

/// Periodic sweeper
pub struct Janitor {
    tasks: Vec<Arc<dyn Maintenance>>,
    every: Duration,
    shutdown: AtomicBool,
    wake: Notify,
}

impl Janitor {
    /// Create a janitor that runs every `every`
    pub fn new(every: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            every,
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Add a maintenance target
    pub fn with_task(mut self, task: Arc<dyn Maintenance>) -> Self {
        self.tasks.push(task);
        self
    }

    /// Sweep every target once; failures are logged and skipped
    pub async fn run_once(&self) -> usize {
        let mut removed = 0;
        for task in &self.tasks {
            match task.sweep().await {
                Ok(n) => {
                    debug!(task = task.name(), removed = n, "Maintenance pass");
                    removed += n;
                }
                Err(e) => warn!(task = task.name(), error = %e, "Maintenance pass failed"),
            }
        }
        removed
    }

    /// Run the janitor loop until [`Janitor::shutdown`] is called
    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        info!(every = ?self.every, tasks = self.tasks.len(), "Starting janitor");

        let mut tick = interval(self.every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        tick.tick().await;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = tick.tick() => {
                    self.run_once().await;
                }
                _ = self.wake.notified() => {}
            }
        }
        info!("Janitor shutting down");
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

// =============================================================================
// Tests
// =============================================================================
