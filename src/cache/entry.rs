//! Cache Entry Types
//!
//! A cached value plus the metadata every tier needs: an absolute expiry, the
//! payload size used for budget accounting, and the tier that produced it on
//! the last read. Persisted tiers store entries as self-describing records.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::compression::{CompressionAlgorithm, CompressionManager};
use super::tier::TierKind;
use crate::error::{Error, Result};

/// Record magic
const RECORD_MAGIC: &[u8; 4] = b"STRM";

/// Record format version
const RECORD_VERSION: u8 = 1;

/// magic + version + algorithm + key length
const FIXED_PREFIX_LEN: usize = 4 + 1 + 1 + 4;

// =============================================================================
// Keys
// =============================================================================

/// Build a namespaced key such as `article:42:comments`.
///
/// Prefix invalidation relies on the namespace coming first, so
/// `clear(Some("article:42:"))` drops everything cached for article 42.
pub fn cache_key(namespace: &str, parts: &[&str]) -> String {
    let mut key = String::with_capacity(
        namespace.len() + parts.iter().map(|p| p.len() + 1).sum::<usize>(),
    );
    key.push_str(namespace);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

/// Build a key that embeds a digest of arbitrary arguments, e.g. the
/// parameters of a query whose result is being memoized.
pub fn hashed_key<A: Serialize + ?Sized>(namespace: &str, args: &A) -> Result<String> {
    let encoded = serde_json::to_vec(args)?;
    let digest = Sha256::digest(&encoded);
    Ok(format!("{}:{}", namespace, &hex::encode(digest)[..16]))
}

/// One-way mapping from a key to a filesystem-safe name
pub fn key_digest(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

// =============================================================================
// Entry
// =============================================================================

/// Cache entry containing data and metadata
#[derive(Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Serialized value (zero-copy)
    value: Bytes,
    /// Absolute expiry, epoch milliseconds
    expires_at: u64,
    /// Payload size used for capacity accounting
    size_bytes: u64,
    /// Tier that served this entry on the last read
    tier_origin: Option<TierKind>,
}

impl CacheEntry {
    /// Create an entry expiring at an absolute instant
    pub fn new(value: Bytes, expires_at: u64) -> Self {
        let size_bytes = value.len() as u64;
        Self {
            value,
            expires_at,
            size_bytes,
            tier_origin: None,
        }
    }

    /// Create an entry that lives for `ttl` from `now_millis`
    pub fn with_ttl(value: Bytes, ttl: Duration, now_millis: u64) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self::new(value, now_millis.saturating_add(ttl_ms))
    }

    /// Get the payload (zero-copy)
    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Absolute expiry in epoch milliseconds
    #[inline]
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Payload size in bytes
    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// An entry is logically absent once `expires_at <= now`
    #[inline]
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at <= now_millis
    }

    /// Remaining lifetime, or `None` once expired
    pub fn remaining_ttl(&self, now_millis: u64) -> Option<Duration> {
        if self.is_expired(now_millis) {
            None
        } else {
            Some(Duration::from_millis(self.expires_at - now_millis))
        }
    }

    /// Tier that produced the entry on the last read
    #[inline]
    pub fn tier_origin(&self) -> Option<TierKind> {
        self.tier_origin
    }

    /// Tag the entry with the tier that served it
    pub(crate) fn served_by(mut self, tier: TierKind) -> Self {
        self.tier_origin = Some(tier);
        self
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size_bytes", &self.size_bytes)
            .field("expires_at", &self.expires_at)
            .field("tier_origin", &self.tier_origin)
            .finish()
    }
}

// =============================================================================
// Record Codec
// =============================================================================

/// Header of a persisted record, readable without touching the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Full cache key (collision check and prefix matching)
    pub key: String,
    /// Absolute expiry, epoch milliseconds
    pub expires_at: u64,
    /// Payload compression
    pub algorithm: CompressionAlgorithm,
}

/// Encode an entry as a self-describing record.
///
/// Layout (big endian): `STRM | version u8 | algorithm u8 | key_len u32 |
/// key | expires_at u64 | payload`.
pub fn encode_record(key: &str, entry: &CacheEntry, compression: &CompressionManager) -> Bytes {
    let (payload, algorithm) = compression.compress(entry.value());

    let mut buf = BytesMut::with_capacity(FIXED_PREFIX_LEN + key.len() + 8 + payload.len());
    buf.put_slice(RECORD_MAGIC);
    buf.put_u8(RECORD_VERSION);
    buf.put_u8(algorithm.tag());
    buf.put_u32(key.len() as u32);
    buf.put_slice(key.as_bytes());
    buf.put_u64(entry.expires_at());
    buf.put_slice(&payload);
    buf.freeze()
}

/// Decode only the header of a record
pub fn decode_header(record: &[u8]) -> Result<RecordHeader> {
    let (header, _) = split_record(record)?;
    Ok(header)
}

/// Decode a full record into its key and entry
pub fn decode_record(record: &[u8], compression: &CompressionManager) -> Result<(String, CacheEntry)> {
    let (header, payload) = split_record(record)?;
    let value = compression.decompress(payload, header.algorithm)?;
    Ok((header.key, CacheEntry::new(value, header.expires_at)))
}

fn split_record(record: &[u8]) -> Result<(RecordHeader, &[u8])> {
    if record.len() < FIXED_PREFIX_LEN {
        return Err(Error::Codec(format!("record too short: {} bytes", record.len())));
    }

    let mut cursor = record;
    if &cursor[..4] != RECORD_MAGIC {
        return Err(Error::Codec("bad magic".into()));
    }
    cursor.advance(4);

    let version = cursor.get_u8();
    if version != RECORD_VERSION {
        return Err(Error::Codec(format!("unsupported record version {}", version)));
    }

    let algorithm = CompressionAlgorithm::from_tag(cursor.get_u8())
        .ok_or_else(|| Error::Codec("unknown compression tag".into()))?;

    let key_len = cursor.get_u32() as usize;
    if cursor.remaining() < key_len + 8 {
        return Err(Error::Codec("truncated record header".into()));
    }

    let key = std::str::from_utf8(&cursor[..key_len])
        .map_err(|e| Error::Codec(format!("key is not UTF-8: {}", e)))?
        .to_string();
    cursor.advance(key_len);

    let expires_at = cursor.get_u64();

    Ok((
        RecordHeader {
            key,
            expires_at,
            algorithm,
        },
        cursor,
    ))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compression::CompressionConfig;

    #[test]
    fn test_cache_key() {
        assert_eq!(cache_key("article", &["42", "comments"]), "article:42:comments");
        assert_eq!(cache_key("avatar", &[]), "avatar");
    }

    #[test]
    fn test_hashed_key_is_stable_and_argument_sensitive() {
        let a = hashed_key("query", &("posts", 10, 0)).unwrap();
        let b = hashed_key("query", &("posts", 10, 0)).unwrap();
        let c = hashed_key("query", &("posts", 10, 10)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("query:"));
        assert_eq!(a.len(), "query:".len() + 16);
    }

    #[test]
    fn test_key_digest_is_path_safe() {
        let digest = key_digest("../../etc/passwd?x=1");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_entry_expiry_boundary() {
        let entry = CacheEntry::new(Bytes::from_static(b"v"), 1_000);
        assert!(!entry.is_expired(999));
        // expires_at <= now is already a miss
        assert!(entry.is_expired(1_000));
        assert_eq!(entry.remaining_ttl(400), Some(Duration::from_millis(600)));
        assert_eq!(entry.remaining_ttl(1_000), None);
    }

    #[test]
    fn test_entry_with_ttl() {
        let entry = CacheEntry::with_ttl(Bytes::from_static(b"hello"), Duration::from_secs(2), 5_000);
        assert_eq!(entry.expires_at(), 7_000);
        assert_eq!(entry.size_bytes(), 5);
        assert_eq!(entry.tier_origin(), None);
    }

    #[test]
    fn test_entry_with_huge_ttl_saturates() {
        let entry = CacheEntry::with_ttl(Bytes::new(), Duration::MAX, 5_000);
        assert_eq!(entry.expires_at(), u64::MAX);
    }

    #[test]
    fn test_record_preserves_key_and_expiry() {
        let manager = CompressionManager::new();
        let entry = CacheEntry::new(Bytes::from_static(b"<div>fragment</div>"), 123_456);

        let record = encode_record("fragment:home", &entry, &manager);
        let header = decode_header(&record).unwrap();
        assert_eq!(header.key, "fragment:home");
        assert_eq!(header.expires_at, 123_456);

        let (key, decoded) = decode_record(&record, &manager).unwrap();
        assert_eq!(key, "fragment:home");
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_record_compresses_large_payloads() {
        let manager = CompressionManager::with_config(CompressionConfig {
            min_size_bytes: 64,
            ..Default::default()
        });
        let payload = Bytes::from(b"repeat ".repeat(200));
        let entry = CacheEntry::new(payload.clone(), 10);

        let record = encode_record("k", &entry, &manager);
        assert!(record.len() < payload.len());
        assert_eq!(decode_header(&record).unwrap().algorithm, CompressionAlgorithm::Lz4);

        let (_, decoded) = decode_record(&record, &manager).unwrap();
        assert_eq!(decoded.value(), &payload);
    }

    #[test]
    fn test_corrupt_records_rejected() {
        let manager = CompressionManager::new();
        assert!(matches!(decode_header(b"STR"), Err(Error::Codec(_))));
        assert!(matches!(decode_header(b"XXXX\x01\x00\x00\x00\x00\x00"), Err(Error::Codec(_))));

        let entry = CacheEntry::new(Bytes::from_static(b"value"), 1);
        let record = encode_record("some-key", &entry, &manager);
        // Cut inside the key
        assert!(matches!(decode_record(&record[..12], &manager), Err(Error::Codec(_))));
    }
}
