//! Cache Module
//!
//! `DiskCache` is the public face of the cache. It composes the journal, the
//! entry lock cache, the filesystem collaborator and the maintenance worker into
//! get / begin-put / commit-put / abort-put / delete / clear.
//!
//! Per-key state machine: `Unknown -> {Present, NotPresent}`. A write in
//! progress is not a cached state; it is the period during which a
//! `PendingPut` holds the key's exclusive lock.
//!
//! Put protocol, on every exit path:
//!
//! ```text
//! if let Some(mut put) = cache.begin_put(key).await? {
//!     write bytes to put.temp_path()
//!     let result = cache.commit_put(&mut put).await;
//!     cache.abort_put_if_not_committed(&mut put).await?;
//!     result?;
//! }
//! ```
//!
//! Filesystem failures on get/put/delete never surface to callers; they are
//! logged and left for the next recovery or eviction pass. Journal failures do
//! surface, since they mean the write did not happen.

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheConfig, TEMP_FILE_SUFFIX};
use crate::entry_lock_cache::{EntryLockCache, EntryLockGuard, EntryLockStats, EntryState};
use crate::eviction::{EntryDeleter, EvictionManager, EvictionReport};
use crate::filesystem::{FileSystem, LocalFileSystem};
use crate::journal::Journal;
use crate::journal_store::JournalStore;
use crate::maintenance_worker::{
    spawn_worker, MaintenanceHandler, MaintenanceMetrics, MaintenanceQueue, MaintenanceStats,
    MaintenanceTask,
};
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::sqlite_journal_store::SqliteJournalStore;
use crate::touch_buffer::TouchBufferStats;
use crate::{CacheError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Reject keys that could escape the cache directory or collide with reserved files
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key is empty".to_string()));
    }
    if key.contains('/') || key.contains('\\') {
        return Err(CacheError::InvalidKey(format!(
            "key contains a path separator: {}",
            key
        )));
    }
    if key.starts_with('.') {
        return Err(CacheError::InvalidKey(format!(
            "key starts with a reserved '.': {}",
            key
        )));
    }
    if key.ends_with(TEMP_FILE_SUFFIX) {
        return Err(CacheError::InvalidKey(format!(
            "key ends with the temporary suffix {}: {}",
            TEMP_FILE_SUFFIX, key
        )));
    }
    Ok(())
}

/// An in-progress write, owning the key's exclusive lock.
///
/// The lock is released by `abort_put_if_not_committed` or when the value is
/// dropped. Dropping without aborting leaves any temporary file for recovery.
#[derive(Debug)]
pub struct PendingPut {
    key: String,
    temp_path: PathBuf,
    permanent_path: PathBuf,
    committed: bool,
    guard: Option<EntryLockGuard>,
}

impl PendingPut {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// File the caller populates before committing
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn permanent_path(&self) -> &Path {
        &self.permanent_path
    }

    /// Whether the temporary file was renamed into place
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Whether the key's lock is still held
    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }
}

/// Point-in-time view of cache size accounting and maintenance activity
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// In-memory mirror of the journal's size counter
    pub tracked_size_bytes: u64,
    /// Sum of visible journal rows, recomputed from storage
    pub journal_visible_bytes: u64,
    /// Bytes of data files on disk, excluding reserved dot-files
    pub disk_data_bytes: u64,
    /// `tracked_size_bytes - disk_data_bytes`
    pub drift_bytes: i64,
    pub max_size_bytes: u64,
    pub slop_bytes: u64,
    pub locks: EntryLockStats,
    pub touches: TouchBufferStats,
    pub maintenance: MaintenanceStats,
}

impl CacheStats {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Shared state behind every `DiskCache` handle; also the maintenance handler
pub(crate) struct CacheInner {
    config: CacheConfig,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    journal: Arc<Journal>,
    locks: Arc<EntryLockCache>,
    eviction: EvictionManager,
    recovery: RecoveryManager,
    queue: MaintenanceQueue,
    metrics: Arc<MaintenanceMetrics>,
    /// Serializes clears, including canary-triggered ones
    clear_gate: Mutex<()>,
}

impl CacheInner {
    fn permanent_path(&self, key: &str) -> PathBuf {
        self.config.cache_dir.join(key)
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("{}{}", key, TEMP_FILE_SUFFIX))
    }

    async fn get(&self, key: &str) -> Option<PathBuf> {
        if let Err(e) = validate_key(key) {
            debug!("Rejecting get: {}", e);
            return None;
        }

        let guard = self.locks.read(key).await;
        let state = match guard.state() {
            EntryState::Unknown => {
                let path = self.permanent_path(key);
                let probed = if self.fs.exists(&path) {
                    EntryState::Present(path)
                } else {
                    EntryState::NotPresent
                };
                guard.set_state(probed.clone());
                probed
            }
            known => known,
        };
        drop(guard);

        match state {
            EntryState::Present(path) => {
                self.journal.touch(key);
                Some(path)
            }
            _ => None,
        }
    }

    async fn ensure_canary(&self) -> Result<()> {
        let canary = self.config.canary_path();
        if self.fs.exists(&canary) {
            return Ok(());
        }

        let _gate = self.clear_gate.lock().await;
        // Another caller may have recreated it while we waited
        if !self.fs.exists(&canary) {
            warn!(
                "Cache canary missing, clearing cache: canary={:?}",
                canary
            );
            self.clear_locked().await?;
        }
        Ok(())
    }

    async fn begin_put(&self, key: &str) -> Result<Option<PendingPut>> {
        validate_key(key)?;
        self.ensure_canary().await?;

        let guard = self.locks.write(key).await;
        let permanent_path = self.permanent_path(key);
        if self.fs.exists(&permanent_path) {
            debug!("Put rejected, entry already present: key={}", key);
            guard.set_state(EntryState::Present(permanent_path));
            return Ok(None);
        }

        let temp_path = self.temp_path(key);
        self.fs.create_file(&temp_path)?;
        Ok(Some(PendingPut {
            key: key.to_string(),
            temp_path,
            permanent_path,
            committed: false,
            guard: Some(guard),
        }))
    }

    async fn commit_put(&self, put: &mut PendingPut) -> Result<()> {
        let result = self.commit_locked(put).await;
        self.eviction.maybe_schedule_eviction();
        result
    }

    async fn commit_locked(&self, put: &mut PendingPut) -> Result<()> {
        let Some(guard) = put.guard.as_ref() else {
            return Err(CacheError::InvalidState(format!(
                "commit of released put: key={}",
                put.key
            )));
        };
        if put.committed {
            return Err(CacheError::InvalidState(format!(
                "put already committed: key={}",
                put.key
            )));
        }

        let size = self.fs.length(&put.temp_path)?;
        self.journal.record_put(&put.key, size).await?;

        match self.fs.rename(&put.temp_path, &put.permanent_path) {
            Ok(()) => {
                if let Err(e) = self
                    .fs
                    .set_modified_time(&put.permanent_path, self.clock.now_millis())
                {
                    debug!(
                        "Failed to set modified time: key={}, error={}",
                        put.key, e
                    );
                }
                guard.set_state(EntryState::Present(put.permanent_path.clone()));
                put.committed = true;
                debug!("Committed put: key={}, size={}", put.key, size);
            }
            Err(e) => {
                // Journal row and temp file are both left for recovery
                warn!(
                    "Rename failed on commit, leaving for recovery: key={}, error={}",
                    put.key, e
                );
            }
        }
        Ok(())
    }

    async fn abort_put_if_not_committed(&self, put: &mut PendingPut) -> Result<()> {
        let Some(guard) = put.guard.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if self.fs.exists(&put.temp_path) {
            if let Err(e) = self.fs.delete(&put.temp_path) {
                warn!(
                    "Failed to delete temp file on abort: key={}, error={}",
                    put.key, e
                );
            }
            result = self.journal.abort_put(&put.key).await;
            guard.set_state(EntryState::Unknown);
            debug!("Aborted put: key={}", put.key);
        }

        drop(guard);
        result
    }

    async fn delete(&self, keys: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::with_capacity(keys.len());
        let keys: Vec<String> = keys
            .iter()
            .filter(|key| match validate_key(key) {
                Ok(()) => seen.insert(key.to_string()),
                Err(e) => {
                    debug!("Skipping delete: {}", e);
                    false
                }
            })
            .cloned()
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        self.journal.mark_pending_delete(&keys).await?;

        let mut deleted = Vec::with_capacity(keys.len());
        let mut pending_rows = Vec::with_capacity(keys.len());
        for key in &keys {
            let guard = self.locks.write(key).await;

            // A put may have committed between the mark and the lock
            let pending = match self.journal.entry(key).await? {
                Some(row) if !row.pending_delete => {
                    debug!("Skipping delete, entry was written again: key={}", key);
                    continue;
                }
                Some(_) => true,
                None => false,
            };

            let path = self.permanent_path(key);
            let removed = match self.fs.delete(&path) {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => true,
                Err(e) => {
                    warn!("Failed to delete cache file: key={}, error={}", key, e);
                    !self.fs.exists(&path)
                }
            };
            // Logically absent either way; a surviving file is left for recovery
            guard.set_state(EntryState::NotPresent);
            if removed {
                if pending {
                    pending_rows.push(key.clone());
                }
                deleted.push(key.clone());
            }
        }

        self.journal.delete(&pending_rows).await?;
        Ok(deleted)
    }

    async fn clear(&self) -> Result<()> {
        let _gate = self.clear_gate.lock().await;
        self.clear_locked().await
    }

    /// Wipe data files, journal and lock state, then recreate the canary
    async fn clear_locked(&self) -> Result<()> {
        let cache_dir = &self.config.cache_dir;
        self.fs.create_dir_all(cache_dir)?;

        let mut removed = 0usize;
        for path in self.fs.list_dir(cache_dir)? {
            let reserved = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            if reserved {
                continue;
            }
            match self.fs.delete_recursive(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove path during clear: path={:?}, error={}", path, e),
            }
        }

        self.journal.clear().await?;
        self.locks.clear();
        self.journal.open().await?;
        self.fs.create_file(&self.config.canary_path())?;

        info!(
            "Cache cleared: cache_dir={:?}, paths_removed={}",
            cache_dir, removed
        );
        Ok(())
    }

    /// Bytes of data files, excluding reserved dot-files at the top level
    fn disk_data_bytes(&self) -> Result<u64> {
        let cache_dir = &self.config.cache_dir;
        let total = self.fs.directory_size(cache_dir)?;
        let mut reserved = 0u64;
        for path in self.fs.list_dir(cache_dir)? {
            let is_reserved = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with('.'))
                .unwrap_or(false);
            if is_reserved && !self.fs.is_dir(&path) {
                reserved += self.fs.length(&path).unwrap_or(0);
            }
        }
        Ok(total.saturating_sub(reserved))
    }

    async fn stats(&self) -> Result<CacheStats> {
        let tracked_size_bytes = self.journal.current_size_bytes();
        let disk_data_bytes = self.disk_data_bytes()?;
        let stats = CacheStats {
            tracked_size_bytes,
            journal_visible_bytes: self.journal.visible_size_sum().await?,
            disk_data_bytes,
            drift_bytes: tracked_size_bytes as i64 - disk_data_bytes as i64,
            max_size_bytes: self.eviction.maximum_size_bytes(),
            slop_bytes: self.eviction.slop_bytes(),
            locks: self.locks.stats(),
            touches: self.journal.touch_stats(),
            maintenance: self.metrics.snapshot(),
        };

        if stats.drift_bytes.unsigned_abs() > stats.slop_bytes {
            debug!(
                "Cache size drift exceeds slop: tracked={}, disk={}, drift={}",
                stats.tracked_size_bytes, stats.disk_data_bytes, stats.drift_bytes
            );
        }
        Ok(stats)
    }

    async fn evict(&self) -> Result<EvictionReport> {
        self.eviction.run(self, &self.metrics).await
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        self.recovery.run(self, &self.metrics).await
    }
}

#[async_trait]
impl EntryDeleter for CacheInner {
    async fn delete_entries(&self, keys: &[String]) -> Result<Vec<String>> {
        self.delete(keys).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.clear().await
    }
}

#[async_trait]
impl MaintenanceHandler for CacheInner {
    async fn handle(&self, task: MaintenanceTask) -> Result<()> {
        match task {
            MaintenanceTask::FlushTouches(batch) => {
                self.journal.apply_touches(&batch).await?;
                MaintenanceMetrics::add(&self.metrics.touch_flushes, 1);
                MaintenanceMetrics::add(&self.metrics.touches_applied, batch.len() as u64);
                Ok(())
            }
            MaintenanceTask::Evict => self.evict().await.map(|_| ()),
            MaintenanceTask::Recover => self.recover().await.map(|_| ()),
            MaintenanceTask::Barrier(done) => {
                let _ = done.send(());
                Ok(())
            }
        }
    }
}

/// Journaled, size-bounded, crash-recoverable disk cache
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<CacheInner>,
}

impl DiskCache {
    /// Open the cache.
    ///
    /// Creates the cache directory, loads the journal's size counter and starts
    /// the maintenance worker. A missing canary clears the cache before the
    /// canary is written. One recovery pass and one eviction pass are queued.
    pub async fn open(
        config: CacheConfig,
        fs: Arc<dyn FileSystem>,
        store: Arc<dyn JournalStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        fs.create_dir_all(&config.cache_dir)?;

        let (queue, receiver) = MaintenanceQueue::channel();
        let journal = Arc::new(Journal::new(store, clock.clone(), queue.clone(), &config));
        journal.open().await?;

        let locks = Arc::new(EntryLockCache::new(config.inactive_lock_capacity));
        let metrics = Arc::new(MaintenanceMetrics::default());
        let eviction = EvictionManager::new(&config, journal.clone(), clock.clone(), queue.clone());
        let recovery = RecoveryManager::new(
            config.cache_dir.clone(),
            fs.clone(),
            locks.clone(),
            journal.clone(),
        );

        let inner = Arc::new(CacheInner {
            config,
            fs,
            clock,
            journal,
            locks,
            eviction,
            recovery,
            queue,
            metrics: metrics.clone(),
            clear_gate: Mutex::new(()),
        });
        let _worker = spawn_worker(Arc::downgrade(&inner), receiver, metrics);

        if !inner.fs.exists(&inner.config.canary_path()) {
            info!(
                "No canary in cache directory, starting empty: cache_dir={:?}",
                inner.config.cache_dir
            );
            inner.clear().await?;
        }

        inner.queue.enqueue(MaintenanceTask::Recover)?;
        inner.queue.enqueue(MaintenanceTask::Evict)?;

        info!(
            "Disk cache opened: cache_dir={:?}, size_bytes={}, max_size_bytes={}",
            inner.config.cache_dir,
            inner.journal.current_size_bytes(),
            inner.eviction.maximum_size_bytes()
        );
        Ok(Self { inner })
    }

    /// Open with the local filesystem, the SQLite journal and the system clock
    pub async fn open_with_defaults(config: CacheConfig) -> Result<Self> {
        let store = SqliteJournalStore::open(&config.journal_path()).await?;
        Self::open(
            config,
            Arc::new(LocalFileSystem),
            Arc::new(store),
            Arc::new(SystemClock),
        )
        .await
    }

    /// Path of the entry's file, or `None` if absent or in doubt
    pub async fn get(&self, key: &str) -> Option<PathBuf> {
        self.inner.get(key).await
    }

    /// Start a write. Returns `None` when the entry already exists.
    pub async fn begin_put(&self, key: &str) -> Result<Option<PendingPut>> {
        self.inner.begin_put(key).await
    }

    /// Record the populated temporary file in the journal and move it into place.
    ///
    /// A failed rename is not an error: the entry stays absent and recovery
    /// removes the journal row and temporary file later.
    pub async fn commit_put(&self, put: &mut PendingPut) -> Result<()> {
        self.inner.commit_put(put).await
    }

    /// Undo an uncommitted write and release the key's lock. Safe to call repeatedly.
    pub async fn abort_put_if_not_committed(&self, put: &mut PendingPut) -> Result<()> {
        self.inner.abort_put_if_not_committed(put).await
    }

    /// Delete entries, returning the keys whose files are gone afterwards
    pub async fn delete(&self, keys: &[String]) -> Result<Vec<String>> {
        self.inner.delete(keys).await
    }

    pub async fn delete_one(&self, key: &str) -> Result<bool> {
        let deleted = self.inner.delete(&[key.to_string()]).await?;
        Ok(!deleted.is_empty())
    }

    /// Remove every entry. Administrative; not for use alongside active puts.
    pub async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    pub fn current_size_bytes(&self) -> u64 {
        self.inner.journal.current_size_bytes()
    }

    pub fn maximum_size_bytes(&self) -> u64 {
        self.inner.eviction.maximum_size_bytes()
    }

    /// Change the maximum; a decrease schedules an eviction check
    pub fn set_maximum_size_bytes(&self, maximum_size_bytes: u64) {
        self.inner
            .eviction
            .set_maximum_size_bytes(maximum_size_bytes);
    }

    /// Queue an eviction pass regardless of size
    pub fn trigger_eviction(&self) -> Result<()> {
        self.inner.eviction.trigger_eviction()
    }

    /// Queue a recovery pass
    pub fn trigger_recovery(&self) -> Result<()> {
        self.inner.queue.enqueue(MaintenanceTask::Recover)
    }

    /// Push buffered touches to the maintenance worker
    pub fn flush_touches(&self) {
        self.inner.journal.flush_touches();
    }

    /// Wait until every maintenance task queued so far has run
    pub async fn wait_for_maintenance(&self) -> Result<()> {
        self.inner.queue.barrier().await
    }

    /// Flush touches and drain the maintenance queue
    pub async fn shutdown(&self) -> Result<()> {
        self.flush_touches();
        match self.wait_for_maintenance().await {
            Ok(()) => {
                info!("Disk cache shut down cleanly");
                Ok(())
            }
            Err(e) => {
                error!("Disk cache shutdown could not drain maintenance: {}", e);
                Err(e)
            }
        }
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.inner.stats().await
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// The underlying journal
    pub fn journal(&self) -> &Journal {
        &self.inner.journal
    }
}
