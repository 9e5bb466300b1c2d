//! Eviction Integration Tests
//!
//! LRU ordering, the staleness pass and maximum-size changes, driven through
//! the maintenance worker with a manual clock.

mod common;

use common::{put_bytes, test_config, TestCache};
use disk_journal_cache::CacheConfig;
use std::time::Duration;
use tempfile::TempDir;

async fn put_aged(t: &TestCache, key: &str, size: usize) {
    assert!(put_bytes(&t.cache, key, &vec![1u8; size]).await);
    t.clock.advance(1_000);
}

#[tokio::test]
async fn test_lru_eviction_removes_oldest_until_under_maximum() {
    let t = TestCache::open().await;
    put_aged(&t, "a", 10).await;
    put_aged(&t, "b", 20).await;
    put_aged(&t, "c", 5).await;
    assert_eq!(t.cache.current_size_bytes(), 35);

    t.cache.set_maximum_size_bytes(20);
    t.cache.wait_for_maintenance().await.unwrap();

    assert!(t.cache.get("a").await.is_none());
    assert!(t.cache.get("b").await.is_none());
    assert!(t.cache.get("c").await.is_some());
    assert_eq!(t.cache.current_size_bytes(), 5);
    assert!(!t.cache_dir().join("a").exists());

    let stats = t.cache.stats().await.unwrap();
    assert_eq!(stats.maintenance.entries_evicted, 2);
    assert_eq!(stats.disk_data_bytes, 5);
}

#[tokio::test]
async fn test_recent_get_protects_entry_from_eviction() {
    let t = TestCache::open().await;
    put_aged(&t, "a", 10).await;
    put_aged(&t, "b", 10).await;
    put_aged(&t, "c", 10).await;

    // Touch the oldest entry so it becomes the newest
    assert!(t.cache.get("a").await.is_some());
    t.cache.flush_touches();
    t.cache.wait_for_maintenance().await.unwrap();

    t.cache.set_maximum_size_bytes(20);
    t.cache.wait_for_maintenance().await.unwrap();

    assert!(t.cache.get("a").await.is_some());
    assert!(t.cache.get("b").await.is_none());
    assert!(t.cache.get("c").await.is_some());
}

#[tokio::test]
async fn test_commit_over_maximum_schedules_eviction() {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig {
        max_size_bytes: 25,
        ..test_config(&temp_dir)
    };
    let t = TestCache::open_with(temp_dir, config).await;

    put_aged(&t, "a", 10).await;
    put_aged(&t, "b", 10).await;
    put_aged(&t, "c", 10).await;
    t.cache.wait_for_maintenance().await.unwrap();

    assert!(t.cache.get("a").await.is_none());
    assert_eq!(t.cache.current_size_bytes(), 20);
}

#[tokio::test]
async fn test_slop_tolerates_small_overshoot() {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig {
        max_size_bytes: 100,
        slop_fraction: 0.1,
        slop_cap_bytes: 1_000,
        ..test_config(&temp_dir)
    };
    let t = TestCache::open_with(temp_dir, config).await;

    put_aged(&t, "a", 60).await;
    put_aged(&t, "b", 45).await;
    t.cache.wait_for_maintenance().await.unwrap();

    // 105 bytes is within max + slop
    assert_eq!(t.cache.current_size_bytes(), 105);
    assert!(t.cache.get("a").await.is_some());
}

#[tokio::test]
async fn test_stale_entry_evicted_under_maximum() {
    let temp_dir = TempDir::new().unwrap();
    let config = CacheConfig {
        stale_threshold: Duration::from_secs(3600),
        ..test_config(&temp_dir)
    };
    let t = TestCache::open_with(temp_dir, config).await;

    put_aged(&t, "old", 10).await;
    t.clock.advance(2 * 3600 * 1000);
    put_aged(&t, "fresh", 10).await;

    t.cache.trigger_eviction().unwrap();
    t.cache.wait_for_maintenance().await.unwrap();

    assert!(t.cache.get("old").await.is_none());
    assert!(t.cache.get("fresh").await.is_some());
    assert_eq!(t.cache.current_size_bytes(), 10);

    let stats = t.cache.stats().await.unwrap();
    assert_eq!(stats.maintenance.stale_entries_evicted, 1);
}

#[tokio::test]
async fn test_redundant_eviction_triggers_are_harmless() {
    let t = TestCache::open().await;
    put_aged(&t, "a", 10).await;

    for _ in 0..5 {
        t.cache.trigger_eviction().unwrap();
    }
    t.cache.wait_for_maintenance().await.unwrap();

    assert!(t.cache.get("a").await.is_some());
    let stats = t.cache.stats().await.unwrap();
    assert_eq!(stats.maintenance.fatal_errors, 0);
    assert!(stats.maintenance.eviction_runs >= 5);
}

#[tokio::test]
async fn test_raising_maximum_does_not_evict() {
    let t = TestCache::open().await;
    put_aged(&t, "a", 10).await;

    t.cache.set_maximum_size_bytes(2 * 1024 * 1024);
    t.cache.wait_for_maintenance().await.unwrap();

    assert_eq!(t.cache.maximum_size_bytes(), 2 * 1024 * 1024);
    assert!(t.cache.get("a").await.is_some());
}
