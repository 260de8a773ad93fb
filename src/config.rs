//! Configuration surface for the cache and pool.
//!
//! The recognized option names are camelCase in YAML/JSON
//! (`memoryByteBudget`, `poolMaxHandles`, ...). Every option has a default,
//! so an empty document is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{
    CompressionConfig, DistributedTierConfig, DurableTierConfig, MemoryTierConfig,
    OrchestratorConfig, DEFAULT_NAMESPACE,
};
use crate::error::{Error, Result};
use crate::pool::PoolConfig;

/// Default in-process byte budget (64MB)
pub const DEFAULT_MEMORY_BYTE_BUDGET: u64 = 64 * 1024 * 1024;

/// Default time-to-live for cached values (1 hour)
pub const DEFAULT_TTL_SECONDS: u64 = 3600;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Byte budget for the memory tier
    pub memory_byte_budget: u64,
    /// Enable the shared/distributed tier
    pub distributed_enabled: bool,
    /// Endpoint of the distributed key/value service
    pub distributed_endpoint: String,
    /// Prefix for every key this cache writes to the distributed service
    pub distributed_namespace: String,
    /// Bound on each (re)connect attempt to the distributed tier
    pub distributed_connect_timeout_ms: u64,
    /// Directory holding durable records
    pub durable_directory: PathBuf,
    /// TTL applied when a caller does not pass one
    pub default_ttl_seconds: u64,
    /// Maximum live backend handles
    pub pool_max_handles: usize,
    /// Fraction of `pool_max_handles` kept idle after release
    pub pool_min_idle_fraction: f64,
    /// Default acquire timeout
    pub acquire_timeout_seconds: f64,
    /// Collapse concurrent misses for the same key into one producer call
    pub single_flight: bool,
    /// Payloads at least this large are LZ4-compressed in persisted records
    pub compression_min_bytes: u64,
    /// Period of the background expiry sweep / pool health check
    pub sweep_interval_seconds: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            memory_byte_budget: DEFAULT_MEMORY_BYTE_BUDGET,
            distributed_enabled: false,
            distributed_endpoint: "redis://127.0.0.1:6379".to_string(),
            distributed_namespace: DEFAULT_NAMESPACE.to_string(),
            distributed_connect_timeout_ms: 250,
            durable_directory: PathBuf::from("/var/cache/stratum"),
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            pool_max_handles: 10,
            pool_min_idle_fraction: 0.5,
            acquire_timeout_seconds: 5.0,
            single_flight: true,
            compression_min_bytes: 1024,
            sweep_interval_seconds: 300,
        }
    }
}

impl CoreConfig {
    /// Parse a YAML (or JSON, which is a YAML subset) document
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(source)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&source)
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if self.memory_byte_budget == 0 {
            return Err(Error::Config("memoryByteBudget must be > 0".into()));
        }
        if self.default_ttl_seconds == 0 {
            return Err(Error::Config("defaultTtlSeconds must be > 0".into()));
        }
        if self.pool_max_handles == 0 {
            return Err(Error::Config("poolMaxHandles must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.pool_min_idle_fraction) {
            return Err(Error::Config(format!(
                "poolMinIdleFraction must be within [0, 1], got {}",
                self.pool_min_idle_fraction
            )));
        }
        if !self.acquire_timeout_seconds.is_finite() || self.acquire_timeout_seconds < 0.0 {
            return Err(Error::Config(format!(
                "acquireTimeoutSeconds must be a non-negative number, got {}",
                self.acquire_timeout_seconds
            )));
        }
        if self.distributed_enabled && self.distributed_endpoint.trim().is_empty() {
            return Err(Error::Config(
                "distributedEndpoint is required when distributedEnabled is set".into(),
            ));
        }
        if self.distributed_namespace.is_empty() {
            return Err(Error::Config(
                "distributedNamespace must not be empty".into(),
            ));
        }
        if self.distributed_connect_timeout_ms == 0 {
            return Err(Error::Config(
                "distributedConnectTimeoutMs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    /// Default acquire timeout as a duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.acquire_timeout_seconds)
    }

    /// Background sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }

    /// Memory tier settings
    pub fn memory_tier(&self) -> MemoryTierConfig {
        MemoryTierConfig {
            byte_budget: self.memory_byte_budget,
            ..Default::default()
        }
    }

    /// Distributed tier settings
    pub fn distributed_tier(&self) -> DistributedTierConfig {
        DistributedTierConfig {
            endpoint: self.distributed_endpoint.clone(),
            namespace: self.distributed_namespace.clone(),
            connect_timeout: Duration::from_millis(self.distributed_connect_timeout_ms),
            compression: self.compression(),
        }
    }

    /// Durable tier settings
    pub fn durable_tier(&self) -> DurableTierConfig {
        DurableTierConfig {
            directory: self.durable_directory.clone(),
            compression: self.compression(),
        }
    }

    /// Orchestrator settings
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_ttl: self.default_ttl(),
            single_flight: self.single_flight,
        }
    }

    /// Pool settings
    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            max_handles: self.pool_max_handles,
            idle_fraction: self.pool_min_idle_fraction,
            acquire_timeout: self.acquire_timeout(),
        }
    }

    fn compression(&self) -> CompressionConfig {
        CompressionConfig {
            min_size_bytes: self.compression_min_bytes,
            ..Default::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
