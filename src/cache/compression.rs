//! Payload compression for persisted records.
//!
//! Durable and distributed records carry a one-byte algorithm tag so a reader
//! never has to guess how the payload was written.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Largest payload a compressed record may expand to
pub const DEFAULT_MAX_DECOMPRESSED_BYTES: u64 = 64 * 1024 * 1024;

/// LZ4 block header: little-endian `i32` holding the decompressed size
const LZ4_SIZE_PREFIX: usize = 4;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    /// Stored as-is
    None,
    /// LZ4 block format with the uncompressed size prepended
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// On-disk tag
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    /// Parse an on-disk tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionConfig {
    /// Algorithm for payloads at or above `min_size_bytes`
    pub algorithm: CompressionAlgorithm,
    /// Smaller payloads are stored uncompressed
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
    /// Records claiming a larger decompressed size are rejected unread.
    /// Larger payloads are stored raw.
    pub max_decompressed_bytes: u64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            min_size_bytes: 1024,
            level: 3,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
        }
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Compresses record payloads, falling back to raw bytes when compression
/// fails or does not shrink the payload.
#[derive(Debug, Clone, Default)]
pub struct CompressionManager {
    config: CompressionConfig,
}

impl CompressionManager {
    /// Create a new compression manager with default config
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom config
    pub fn with_config(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress `data`, returning the bytes to store and the algorithm used
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if (data.len() as u64) < self.config.min_size_bytes
            || (data.len() as u64) > self.config.max_decompressed_bytes
            || self.config.algorithm == CompressionAlgorithm::None
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        let mode = lz4::block::CompressionMode::HIGHCOMPRESSION(self.config.level);
        match lz4::block::compress(data, Some(mode), true) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(error = %e, "LZ4 compression failed, storing raw payload");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Reverse `compress`
    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        match algorithm {
            CompressionAlgorithm::None => Ok(Bytes::copy_from_slice(data)),
            CompressionAlgorithm::Lz4 => {
                self.check_declared_size(data)?;
                lz4::block::decompress(data, None)
                    .map(Bytes::from)
                    .map_err(|e| Error::DecompressionFailed {
                        algorithm: algorithm.name().into(),
                        reason: e.to_string(),
                    })
            }
        }
    }

    /// Reject an LZ4 block whose size prefix is negative or over the limit
    /// before anything is allocated for it
    fn check_declared_size(&self, data: &[u8]) -> Result<()> {
        let reject = |reason: String| Error::DecompressionFailed {
            algorithm: CompressionAlgorithm::Lz4.name().into(),
            reason,
        };

        let prefix: [u8; LZ4_SIZE_PREFIX] = data
            .get(..LZ4_SIZE_PREFIX)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| reject("missing size prefix".into()))?;
        let declared = i32::from_le_bytes(prefix);
        if declared < 0 || declared as u64 > self.config.max_decompressed_bytes {
            return Err(reject(format!(
                "declared size {} exceeds limit of {} bytes",
                declared, self.config.max_decompressed_bytes
            )));
        }
        Ok(())
    }

    /// Get configuration
    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}
