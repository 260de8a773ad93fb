//! Durable Tier - on-disk records
//!
//! Survives process restarts. Each entry is one file in the configured
//! directory, named by the SHA-256 of its key so arbitrary keys never
//! escape the directory. The record embeds the full key, which guards
//! against digest collisions and lets prefix clears work without an index.
//!
//! # Design
//!
//! - Writes go to a temp file and are renamed into place, so readers only
//!   ever see complete records
//! - Expired and corrupt records are deleted when read
//! - The directory is created on first write

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::compression::{CompressionConfig, CompressionManager};
use super::entry::{decode_header, decode_record, encode_record, key_digest, CacheEntry};
use super::tier::{CacheTier, TierKind};
use crate::clock::{system_clock, SharedClock};
use crate::error::Result;

const TEMP_PREFIX: &str = ".tmp-";

/// Durable tier configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DurableTierConfig {
    /// Directory holding one file per entry
    pub directory: PathBuf,
    /// Record payload compression
    pub compression: CompressionConfig,
}

impl Default for DurableTierConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/cache/stratum"),
            compression: CompressionConfig::default(),
        }
    }
}

/// File-per-entry tier
pub struct DurableTier {
    config: DurableTierConfig,
    compression: CompressionManager,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    discarded: AtomicU64,
}

impl DurableTier {
    /// Create a tier rooted at `config.directory`
    pub fn new(config: DurableTierConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create with an explicit clock
    pub fn with_clock(config: DurableTierConfig, clock: SharedClock) -> Self {
        Self {
            compression: CompressionManager::with_config(config.compression.clone()),
            config,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Root directory
    pub fn directory(&self) -> &Path {
        &self.config.directory
    }

    /// Path of the record for `key`
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.config.directory.join(key_digest(key))
    }

    /// Count records on disk, expired ones included
    pub async fn record_count(&self) -> Result<usize> {
        Ok(self.record_paths().await?.len())
    }

    /// Get tier statistics
    pub fn stats(&self) -> DurableTierStats {
        DurableTierStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    async fn record_paths(&self) -> Result<Vec<PathBuf>> {
        let mut dir = match fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(TEMP_PREFIX) || !item.file_type().await?.is_file() {
                continue;
            }
            paths.push(item.path());
        }
        Ok(paths)
    }

    /// Remove a file, ignoring one that is already gone
    async fn remove_file(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn discard(&self, path: &Path, reason: &str) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), reason, "Discarding durable record");
        if let Err(e) = Self::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove durable record");
        }
    }

    /// Visit each record header; `remove` decides which records to delete
    async fn sweep<F>(&self, mut remove: F) -> Result<usize>
    where
        F: FnMut(&str, u64) -> bool + Send,
    {
        let mut removed = 0;
        for path in self.record_paths().await? {
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let doomed = match decode_header(&raw) {
                Ok(header) => remove(&header.key, header.expires_at),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable durable record");
                    false
                }
            };
            if doomed && Self::remove_file(&path).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Durable tier statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableTierStats {
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Records written
    pub writes: u64,
    /// Expired or corrupt records deleted on read
    pub discarded: u64,
}

#[async_trait]
impl CacheTier for DurableTier {
    fn kind(&self) -> TierKind {
        TierKind::Durable
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.record_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let entry = match decode_record(&raw, &self.compression) {
            Ok((stored_key, entry)) if stored_key == key => entry,
            Ok((stored_key, _)) => {
                // Digest collision; leave the other key's record alone
                warn!(key, stored_key, "Durable record belongs to another key");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            Err(e) => {
                self.discard(&path, &e.to_string()).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        };

        if entry.is_expired(self.clock.now_millis()) {
            self.discard(&path, "expired").await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(entry.served_by(TierKind::Durable)))
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        if entry.is_expired(self.clock.now_millis()) {
            // The previous value must not outlive a rejected write
            Self::remove_file(&self.record_path(key)).await?;
            return Ok(());
        }

        fs::create_dir_all(&self.config.directory).await?;
        let record = encode_record(key, &entry, &self.compression);

        let final_path = self.record_path(key);
        let temp_path = self
            .config
            .directory
            .join(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&record).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &final_path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Self::remove_file(&self.record_path(key)).await
    }

    async fn clear(&self, prefix: Option<&str>) -> Result<usize> {
        match prefix {
            None => {
                let mut removed = 0;
                for path in self.record_paths().await? {
                    if Self::remove_file(&path).await? {
                        removed += 1;
                    }
                }
                Ok(removed)
            }
            Some(prefix) => self.sweep(|key, _| key.starts_with(prefix)).await,
        }
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        self.sweep(|_, expires_at| expires_at <= now).await
    }
}

// =============================================================================
// Tests
// =============================================================================
