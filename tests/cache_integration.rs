//! End-to-end tests for the layered cache

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use stratum::cache::{
    CacheEntry, CacheTier, DistributedTier, DistributedTierConfig, DurableTier, DurableTierConfig,
    InMemoryRemoteStore, MemoryTier, MemoryTierConfig, TierKind,
};
use stratum::{CacheOrchestrator, Clock, Error, ManualClock};

// =============================================================================
// Test Helpers
// =============================================================================

/// Wraps a tier and records what the orchestrator asked of it
struct Counting<T> {
    inner: T,
    gets: AtomicUsize,
    hits: AtomicUsize,
    sets: AtomicUsize,
    last_set: Mutex<Option<CacheEntry>>,
}

impl<T> Counting<T> {
    fn new(inner: T) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gets: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
            last_set: Mutex::new(None),
        })
    }
}

struct Observed<T>(Arc<Counting<T>>);

#[async_trait]
impl<T: CacheTier> CacheTier for Observed<T> {
    fn kind(&self) -> TierKind {
        self.0.inner.kind()
    }

    async fn get(&self, key: &str) -> stratum::Result<Option<CacheEntry>> {
        self.0.gets.fetch_add(1, Ordering::SeqCst);
        let found = self.0.inner.get(key).await?;
        if found.is_some() {
            self.0.hits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(found)
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> stratum::Result<()> {
        self.0.sets.fetch_add(1, Ordering::SeqCst);
        *self.0.last_set.lock() = Some(entry.clone());
        self.0.inner.set(key, entry).await
    }

    async fn delete(&self, key: &str) -> stratum::Result<bool> {
        self.0.inner.delete(key).await
    }

    async fn clear(&self, prefix: Option<&str>) -> stratum::Result<usize> {
        self.0.inner.clear(prefix).await
    }

    async fn purge_expired(&self) -> stratum::Result<usize> {
        self.0.inner.purge_expired().await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    user_id: u64,
    avatar_url: String,
}

fn profile(user_id: u64) -> Profile {
    Profile {
        user_id,
        avatar_url: format!("https://cdn.example.com/avatars/{}.png", user_id),
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(1_700_000_000_000))
}

fn durable(dir: &tempfile::TempDir, clock: &Arc<ManualClock>) -> DurableTier {
    DurableTier::with_clock(
        DurableTierConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        },
        clock.clone(),
    )
}

fn memory(clock: &Arc<ManualClock>) -> MemoryTier {
    MemoryTier::with_clock(MemoryTierConfig::default(), clock.clone())
}

// =============================================================================
// Backfill
// =============================================================================

#[tokio::test]
async fn test_durable_hit_backfills_memory_with_remaining_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let mem = Counting::new(memory(&clock));
    let disk = Counting::new(durable(&dir, &clock));

    let cache = CacheOrchestrator::builder()
        .clock(clock.clone())
        .tier(Observed(mem.clone()))
        .tier(Observed(disk.clone()))
        .build();

    // Seeded by an earlier process: 100s TTL, 40s already elapsed
    let stored = CacheEntry::with_ttl(
        Bytes::from(serde_json::to_vec(&profile(7)).unwrap()),
        Duration::from_secs(100),
        clock.now_millis(),
    );
    disk.inner.set("profile:7", stored.clone()).await.unwrap();
    clock.advance(Duration::from_secs(40));

    let produced = AtomicUsize::new(0);
    let value: Profile = cache
        .get_with("profile:7", None, || async {
            produced.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Error>(profile(0))
        })
        .await
        .unwrap();
    assert_eq!(value, profile(7));
    assert_eq!(produced.load(Ordering::SeqCst), 0);

    // Memory got the same absolute expiry, i.e. 60s remaining
    let backfilled = mem.last_set.lock().clone().unwrap();
    assert_eq!(backfilled.expires_at(), stored.expires_at());
    assert_eq!(
        backfilled.remaining_ttl(clock.now_millis()),
        Some(Duration::from_secs(60))
    );

    // Next read is served from memory
    let disk_gets = disk.gets.load(Ordering::SeqCst);
    let again: Option<Profile> = cache.get("profile:7").await.unwrap();
    assert_eq!(again, Some(profile(7)));
    assert_eq!(disk.gets.load(Ordering::SeqCst), disk_gets);
    assert_eq!(disk.hits.load(Ordering::SeqCst), 1);
    assert_eq!(mem.sets.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().hits(TierKind::Memory), 1);
    assert_eq!(cache.metrics().hits(TierKind::Durable), 1);
}

#[tokio::test]
async fn test_backfilled_copy_expires_with_source() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let cache = CacheOrchestrator::builder()
        .clock(clock.clone())
        .tier(memory(&clock))
        .tier(durable(&dir, &clock))
        .build();

    cache.set("k", &1u32, Some(Duration::from_secs(30))).await.unwrap();
    clock.advance(Duration::from_secs(29));
    assert_eq!(cache.get::<u32>("k").await.unwrap(), Some(1));

    clock.advance(Duration::from_secs(1));
    assert_eq!(cache.get::<u32>("k").await.unwrap(), None);
}

// =============================================================================
// Expiry and Write-Through
// =============================================================================

#[tokio::test]
async fn test_expired_value_is_a_miss_even_with_stale_bytes() {
    let clock = clock();
    let remote = InMemoryRemoteStore::new();
    let cache = CacheOrchestrator::builder()
        .clock(clock.clone())
        .tier(memory(&clock))
        .tier(DistributedTier::with_clock(
            Arc::new(remote.clone()),
            DistributedTierConfig::default(),
            clock.clone(),
        ))
        .build();

    cache
        .set("fragment:footer", &"<footer/>", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(10));

    // The remote server runs on real time and still holds the bytes
    assert!(remote.raw("stratum:fragment:footer").is_some());
    assert_eq!(cache.get::<String>("fragment:footer").await.unwrap(), None);
}

#[tokio::test]
async fn test_set_is_idempotent_across_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let remote = InMemoryRemoteStore::with_clock(clock.clone());
    let disk = durable(&dir, &clock);
    let records = DurableTier::with_clock(
        DurableTierConfig {
            directory: dir.path().to_path_buf(),
            ..Default::default()
        },
        clock.clone(),
    );

    let cache = CacheOrchestrator::builder()
        .clock(clock.clone())
        .tier(memory(&clock))
        .tier(DistributedTier::with_clock(
            Arc::new(remote.clone()),
            DistributedTierConfig::default(),
            clock.clone(),
        ))
        .tier(disk)
        .build();

    for _ in 0..2 {
        cache.set("profile:1", &profile(1), None).await.unwrap();
    }

    assert_eq!(remote.len(), 1);
    assert_eq!(records.record_count().await.unwrap(), 1);
    assert_eq!(cache.get::<Profile>("profile:1").await.unwrap(), Some(profile(1)));
}

#[tokio::test]
async fn test_prefix_clear_leaves_other_namespaces() {
    let dir = tempfile::tempdir().unwrap();
    let clock = clock();
    let cache = CacheOrchestrator::builder()
        .clock(clock.clone())
        .tier(memory(&clock))
        .tier(durable(&dir, &clock))
        .build();

    cache.set(&stratum::cache_key("article", &["42", "comments"]), &3u32, None).await.unwrap();
    cache.set(&stratum::cache_key("article", &["42", "body"]), &"text", None).await.unwrap();
    cache.set(&stratum::cache_key("article", &["420", "body"]), &"other", None).await.unwrap();

    cache.clear(Some("article:42:")).await.unwrap();

    assert_eq!(cache.get::<u32>("article:42:comments").await.unwrap(), None);
    assert_eq!(cache.get::<String>("article:42:body").await.unwrap(), None);
    assert_eq!(
        cache.get::<String>("article:420:body").await.unwrap().as_deref(),
        Some("other")
    );
}

// =============================================================================
// Distributed Tier Sharing and Outage
// =============================================================================

#[tokio::test]
async fn test_two_processes_share_the_distributed_tier() {
    let clock = clock();
    let remote = InMemoryRemoteStore::with_clock(clock.clone());
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let build = |dir: &tempfile::TempDir| {
        CacheOrchestrator::builder()
            .clock(clock.clone())
            .tier(memory(&clock))
            .tier(DistributedTier::with_clock(
                Arc::new(remote.clone()),
                DistributedTierConfig::default(),
                clock.clone(),
            ))
            .tier(durable(dir, &clock))
            .build()
    };
    let a = build(&dir_a);
    let b = build(&dir_b);

    a.set("profile:5", &profile(5), None).await.unwrap();
    assert_eq!(b.get::<Profile>("profile:5").await.unwrap(), Some(profile(5)));
    assert_eq!(b.metrics().hits(TierKind::Distributed), 1);

    // Outage: b neither errors nor sees new writes from a
    remote.set_available(false);
    a.set("profile:6", &profile(6), None).await.unwrap();
    assert_eq!(b.get::<Profile>("profile:6").await.unwrap(), None);
    assert_eq!(a.get::<Profile>("profile:6").await.unwrap(), Some(profile(6)));

    // Recovery: the lazy reconnect picks the tier back up
    remote.set_available(true);
    a.set("profile:8", &profile(8), None).await.unwrap();
    assert_eq!(b.get::<Profile>("profile:8").await.unwrap(), Some(profile(8)));
}

#[tokio::test]
async fn test_delete_during_reconnect_reaches_distributed_tier() {
    let clock = clock();
    let remote = InMemoryRemoteStore::with_clock(clock.clone());
    let build = || {
        CacheOrchestrator::builder()
            .clock(clock.clone())
            .tier(memory(&clock))
            .tier(DistributedTier::with_clock(
                Arc::new(remote.clone()),
                DistributedTierConfig {
                    connect_timeout: Duration::from_millis(500),
                    ..Default::default()
                },
                clock.clone(),
            ))
            .build()
    };

    let writer = build();
    writer.set("article:42", &"draft", None).await.unwrap();

    // Every connect from here on is slow
    remote.set_connect_delay(Some(Duration::from_millis(50)));
    let editor = build();
    let (read, removed) = tokio::join!(editor.get::<String>("unrelated"), async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        editor.delete("article:42").await
    });
    assert_eq!(read.unwrap(), None);
    assert!(removed.unwrap());

    let fresh = build();
    assert_eq!(fresh.get::<String>("article:42").await.unwrap(), None);
}

#[tokio::test]
async fn test_full_clear_spares_keys_outside_the_namespace() {
    let clock = clock();
    let remote = InMemoryRemoteStore::with_clock(clock.clone());
    let cache = CacheOrchestrator::builder()
        .clock(clock.clone())
        .tier(memory(&clock))
        .tier(DistributedTier::with_clock(
            Arc::new(remote.clone()),
            DistributedTierConfig::default(),
            clock.clone(),
        ))
        .build();

    // Another application sharing the server
    remote.put_raw("session:user:9", Bytes::from_static(b"token"), Duration::from_secs(600));
    cache.set("profile:1", &profile(1), None).await.unwrap();
    cache.set("profile:2", &profile(2), None).await.unwrap();

    cache.clear(None).await.unwrap();

    assert_eq!(cache.get::<Profile>("profile:1").await.unwrap(), None);
    assert_eq!(remote.raw("session:user:9").as_deref(), Some(&b"token"[..]));
    assert_eq!(remote.len(), 1);
}

// =============================================================================
// Producers and Single-Flight
// =============================================================================

#[tokio::test]
async fn test_failed_producer_is_not_cached() {
    let clock = clock();
    let cache = CacheOrchestrator::builder()
        .clock(clock.clone())
        .tier(memory(&clock))
        .build();

    let err = cache
        .get_with("profile:9", None, || async {
            Err::<Profile, _>(std::io::Error::new(std::io::ErrorKind::Other, "db down"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "db down");

    let value = cache
        .get_with("profile:9", None, || async { Ok::<_, Error>(profile(9)) })
        .await
        .unwrap();
    assert_eq!(value, profile(9));
    assert_eq!(cache.metrics().snapshot().producer_failures, 1);
    assert_eq!(cache.metrics().producer_calls(), 2);
}

#[tokio::test]
async fn test_concurrent_misses_share_one_producer_run() {
    let clock = clock();
    let cache = Arc::new(
        CacheOrchestrator::builder()
            .clock(clock.clone())
            .tier(memory(&clock))
            .build(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .get_with("leaderboard", None, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, Error>(vec![profile(1), profile(2)])
                    })
                    .await
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap().len(), 2);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.metrics().snapshot().coalesced, 15);
    assert_eq!(cache.in_flight(), 0);
}

#[tokio::test]
async fn test_waiter_runs_own_producer_after_failure() {
    let clock = clock();
    let cache = Arc::new(
        CacheOrchestrator::builder()
            .clock(clock.clone())
            .tier(memory(&clock))
            .build(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let run = |cache: Arc<CacheOrchestrator>, calls: Arc<AtomicUsize>| {
        tokio::spawn(async move {
            cache
                .get_with("flaky", None, || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    if n == 0 {
                        Err("first attempt failed")
                    } else {
                        Ok(n as u32)
                    }
                })
                .await
        })
    };

    let first = run(cache.clone(), calls.clone());
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = run(cache.clone(), calls.clone());

    assert_eq!(first.await.unwrap(), Err("first attempt failed"));
    assert_eq!(second.await.unwrap(), Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
