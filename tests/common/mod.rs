//! Shared helpers for integration tests

#![allow(dead_code)]

use disk_journal_cache::{
    CacheConfig, DiskCache, FileSystem, LocalFileSystem, ManualClock, SqliteJournalStore,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Local filesystem with switchable rename and delete failures
#[derive(Default)]
pub struct FaultyFileSystem {
    inner: LocalFileSystem,
    fail_rename: AtomicBool,
    fail_delete: AtomicBool,
}

impl FaultyFileSystem {
    pub fn fail_rename(&self, fail: bool) {
        self.fail_rename.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    fn injected(op: &str) -> io::Error {
        io::Error::new(io::ErrorKind::Other, format!("injected {} failure", op))
    }
}

impl FileSystem for FaultyFileSystem {
    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.inner.is_dir(path)
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(Self::injected("delete"));
        }
        self.inner.delete(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        if self.fail_rename.load(Ordering::SeqCst) {
            return Err(Self::injected("rename"));
        }
        self.inner.rename(from, to)
    }

    fn length(&self, path: &Path) -> io::Result<u64> {
        self.inner.length(path)
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        self.inner.create_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn delete_recursive(&self, path: &Path) -> io::Result<()> {
        self.inner.delete_recursive(path)
    }

    fn set_modified_time(&self, path: &Path, modified_ms: u64) -> io::Result<()> {
        self.inner.set_modified_time(path, modified_ms)
    }

    fn directory_size(&self, path: &Path) -> io::Result<u64> {
        self.inner.directory_size(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.list_dir(path)
    }
}

/// A cache opened over a temporary directory with a manual clock
pub struct TestCache {
    pub cache: DiskCache,
    pub fs: Arc<FaultyFileSystem>,
    pub clock: Arc<ManualClock>,
    pub config: CacheConfig,
    pub temp_dir: TempDir,
}

pub const START_MS: u64 = 1_700_000_000_000;

/// Config rooted in `temp_dir` with a large maximum and no slop
pub fn test_config(temp_dir: &TempDir) -> CacheConfig {
    CacheConfig {
        max_size_bytes: 1024 * 1024,
        slop_cap_bytes: 0,
        ..CacheConfig::new(temp_dir.path().join("cache"))
    }
}

impl TestCache {
    pub async fn open() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);
        Self::open_with(temp_dir, config).await
    }

    pub async fn open_with(temp_dir: TempDir, config: CacheConfig) -> Self {
        let fs = Arc::new(FaultyFileSystem::default());
        let clock = Arc::new(ManualClock::new(START_MS));
        let cache = open_cache(&config, fs.clone(), clock.clone()).await;
        Self {
            cache,
            fs,
            clock,
            config,
            temp_dir,
        }
    }

    /// Drop the cache without any shutdown and open it again over the same directory
    pub async fn reopen(self) -> Self {
        let Self {
            cache,
            fs,
            clock,
            config,
            temp_dir,
        } = self;
        drop(cache);
        let cache = open_cache(&config, fs.clone(), clock.clone()).await;
        Self {
            cache,
            fs,
            clock,
            config,
            temp_dir,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }
}

async fn open_cache(
    config: &CacheConfig,
    fs: Arc<FaultyFileSystem>,
    clock: Arc<ManualClock>,
) -> DiskCache {
    let store = SqliteJournalStore::open(&config.journal_path()).await.unwrap();
    let cache = DiskCache::open(config.clone(), fs, Arc::new(store), clock)
        .await
        .unwrap();
    cache.wait_for_maintenance().await.unwrap();
    cache
}

/// Run the full put protocol. Returns false when the key already existed.
pub async fn put_bytes(cache: &DiskCache, key: &str, bytes: &[u8]) -> bool {
    let Some(mut put) = cache.begin_put(key).await.unwrap() else {
        return false;
    };
    std::fs::write(put.temp_path(), bytes).unwrap();
    let result = cache.commit_put(&mut put).await;
    cache.abort_put_if_not_committed(&mut put).await.unwrap();
    result.unwrap();
    true
}
