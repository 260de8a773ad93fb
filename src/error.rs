//! Error types for the layered cache and resource pool

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache and pool
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// A tier could not be reached. Absorbed by the orchestrator, never
    /// returned from the public cache API.
    #[error("Cache tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: String, reason: String },

    /// A stored record could not be decoded
    #[error("Corrupt cache record: {0}")]
    Codec(String),

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Pool Errors
    // =========================================================================
    /// No handle became available before the acquire deadline
    #[error("Timed out after {waited:?} waiting for a pooled handle")]
    AcquireTimeout { waited: Duration },

    /// The backend refused to open a new handle
    #[error("Failed to create backend handle: {0}")]
    HandleCreation(String),

    /// The pool has been shut down
    #[error("Resource pool is closed")]
    PoolClosed,
}

impl Error {
    /// Returns true for errors the pool raises when it could not hand out a
    /// handle in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::AcquireTimeout { .. })
    }

    /// Shorthand for a tier-unavailable error
    pub fn unavailable(tier: impl Into<String>, reason: impl ToString) -> Self {
        Error::TierUnavailable {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }
}
