//! Durable Journal
//!
//! The authority on which entries exist, how large they are and how recently
//! they were used. Wraps a `JournalStore` with:
//!
//! - an in-memory mirror of the aggregate size counter, readable in O(1)
//! - batching of last-modified updates through a `TouchBuffer`, flushed on the
//!   maintenance worker
//! - paged LRU and staleness scans bounded by a page cap
//!
//! Mirror discipline: `record_put` applies its delta to the mirror before the
//! transaction and reverts exactly that delta if the transaction fails. Every
//! decrement is applied only after its transaction has committed.

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::journal_store::{JournalEntry, JournalStore, RecencyCursor, TouchUpdate};
use crate::maintenance_worker::{MaintenanceQueue, MaintenanceTask};
use crate::touch_buffer::{TouchBuffer, TouchBufferStats};
use crate::{CacheError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Durable journal with an in-memory size mirror
pub struct Journal {
    store: Arc<dyn JournalStore>,
    clock: Arc<dyn Clock>,
    queue: MaintenanceQueue,
    size_bytes: AtomicU64,
    touches: TouchBuffer,
    scan_page_size: usize,
    max_scan_pages: usize,
    delete_batch_size: usize,
}

impl Journal {
    pub fn new(
        store: Arc<dyn JournalStore>,
        clock: Arc<dyn Clock>,
        queue: MaintenanceQueue,
        config: &CacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            queue,
            size_bytes: AtomicU64::new(0),
            touches: TouchBuffer::new(config.touch_buffer_size),
            scan_page_size: config.scan_page_size.max(1),
            max_scan_pages: config.max_scan_pages.max(1),
            delete_batch_size: config.delete_batch_size.max(1),
        }
    }

    /// Load the persisted counter into memory. Must run before any other call.
    pub async fn open(&self) -> Result<u64> {
        let size = self.store.load_size().await?;
        self.size_bytes.store(size, Ordering::SeqCst);
        info!("Journal opened: size_bytes={}", size);
        Ok(size)
    }

    /// In-memory mirror of the aggregate counter
    pub fn current_size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::SeqCst)
    }

    fn subtract(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        // Saturate rather than wrap; a persisted counter below the mirror shows up as drift in stats
        let _ = self
            .size_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Upsert a visible row for `key` and add `size_bytes` to the counter
    pub async fn record_put(&self, key: &str, size_bytes: u64) -> Result<()> {
        let now_ms = self.clock.now_millis();
        self.size_bytes.fetch_add(size_bytes, Ordering::SeqCst);

        match self.store.record_put(key, size_bytes, now_ms).await {
            Ok(replaced) => {
                if let Some(replaced) = replaced {
                    self.subtract(replaced);
                }
                debug!("Journal recorded put: key={}, size={}", key, size_bytes);
                Ok(())
            }
            Err(e) => {
                self.subtract(size_bytes);
                warn!("Journal put rolled back: key={}, error={}", key, e);
                Err(e)
            }
        }
    }

    /// Remove the visible row for `key`, if any. Absent rows are a silent no-op.
    pub async fn abort_put(&self, key: &str) -> Result<()> {
        if let Some(size) = self.store.abort_put(key).await? {
            self.subtract(size);
            debug!("Journal aborted put: key={}, size={}", key, size);
        }
        Ok(())
    }

    /// Buffer a last-modified update for `key`; never waits on storage
    pub fn touch(&self, key: &str) {
        if let Some(batch) = self.touches.record(key, self.clock.now_millis()) {
            self.ship_touches(batch);
        }
    }

    /// Push every buffered touch to the maintenance worker
    pub fn flush_touches(&self) {
        let batch = self.touches.take_batch();
        if !batch.is_empty() {
            self.ship_touches(batch);
        }
    }

    fn ship_touches(&self, batch: Vec<TouchUpdate>) {
        let count = batch.len();
        if let Err(e) = self.queue.enqueue(MaintenanceTask::FlushTouches(batch)) {
            warn!("Dropping touch batch: keys={}, error={}", count, e);
        }
    }

    /// Persist a batch of touches. Runs on the maintenance worker.
    pub async fn apply_touches(&self, batch: &[TouchUpdate]) -> Result<()> {
        self.store.touch(batch).await?;
        debug!("Journal applied touches: keys={}", batch.len());
        Ok(())
    }

    /// Exclude `keys` from the counter and flag them pending delete, one
    /// transaction per batch. Returns the bytes excluded.
    pub async fn mark_pending_delete(&self, keys: &[String]) -> Result<u64> {
        let mut total = 0u64;
        for batch in keys.chunks(self.delete_batch_size) {
            let bytes = self.store.mark_pending_delete(batch).await?;
            self.subtract(bytes);
            total += bytes;
        }
        if total > 0 {
            debug!(
                "Journal marked pending delete: keys={}, bytes={}",
                keys.len(),
                total
            );
        }
        Ok(total)
    }

    /// Hard-remove pending-delete rows; no counter effect.
    ///
    /// `keys` must be distinct. Fewer rows than keys is a legitimate race (a put
    /// revived the key); more rows than keys means the row set is corrupt.
    pub async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0u64;
        for batch in keys.chunks(self.delete_batch_size) {
            let rows = self.store.delete_pending(batch).await?;
            if rows > batch.len() as u64 {
                return Err(CacheError::ConsistencyError(format!(
                    "journal delete removed more rows than keys: keys={}, rows={}",
                    batch.len(),
                    rows
                )));
            }
            removed += rows;
        }
        Ok(removed)
    }

    pub async fn pending_delete_keys(&self) -> Result<Vec<String>> {
        self.store.pending_delete_keys().await
    }

    /// Least recently used visible keys whose sizes add up to at least `target_bytes`.
    ///
    /// Running out of rows before the target is met means the counter and the
    /// rows have diverged, which is reported as a consistency error.
    pub async fn least_recently_used(&self, target_bytes: u64) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if target_bytes == 0 {
            return Ok(keys);
        }

        let mut accumulated = 0u64;
        let mut cursor: Option<RecencyCursor> = None;
        for _ in 0..self.max_scan_pages {
            let page = self
                .store
                .recency_page(cursor.as_ref(), self.scan_page_size)
                .await?;

            for entry in page.entries {
                accumulated += entry.size_bytes;
                keys.push(entry.key);
                if accumulated >= target_bytes {
                    return Ok(keys);
                }
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => {
                    return Err(CacheError::ConsistencyError(format!(
                        "journal rows exhausted before eviction target: target_bytes={}, found_bytes={}, tracked_size={}",
                        target_bytes,
                        accumulated,
                        self.current_size_bytes()
                    )));
                }
            }
        }

        Err(CacheError::ScanLimitExceeded(self.max_scan_pages))
    }

    /// Visible keys last modified before `threshold_ms`, in insertion order
    pub async fn stale_entries(&self, threshold_ms: u64) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut after: Option<i64> = None;
        for _ in 0..self.max_scan_pages {
            let page = self
                .store
                .stale_page(threshold_ms, after, self.scan_page_size)
                .await?;
            keys.extend(page.entries.into_iter().map(|entry| entry.key));

            match page.next {
                Some(next) => after = Some(next),
                None => return Ok(keys),
            }
        }

        Err(CacheError::ScanLimitExceeded(self.max_scan_pages))
    }

    /// Delete every row and zero the counter
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        self.size_bytes.store(0, Ordering::SeqCst);
        let discarded = self.touches.discard();
        info!("Journal cleared: discarded_touches={}", discarded);
        Ok(())
    }

    pub async fn entry(&self, key: &str) -> Result<Option<JournalEntry>> {
        self.store.entry(key).await
    }

    /// Sum of visible row sizes recomputed from storage
    pub async fn visible_size_sum(&self) -> Result<u64> {
        self.store.visible_size_sum().await
    }

    pub fn touch_stats(&self) -> TouchBufferStats {
        self.touches.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::journal_store::{InsertionPage, RecencyPage};
    use crate::sqlite_journal_store::SqliteJournalStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    /// Store wrapper whose record_put can be made to fail and whose
    /// delete_pending can over-report
    struct FailingStore {
        inner: SqliteJournalStore,
        fail_puts: AtomicBool,
        extra_deleted_rows: AtomicU64,
    }

    impl FailingStore {
        async fn new() -> Self {
            Self {
                inner: SqliteJournalStore::open_in_memory().await.unwrap(),
                fail_puts: AtomicBool::new(false),
                extra_deleted_rows: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl JournalStore for FailingStore {
        async fn load_size(&self) -> Result<u64> {
            self.inner.load_size().await
        }
        async fn record_put(&self, key: &str, size: u64, now_ms: u64) -> Result<Option<u64>> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(CacheError::JournalError("injected failure".to_string()));
            }
            self.inner.record_put(key, size, now_ms).await
        }
        async fn abort_put(&self, key: &str) -> Result<Option<u64>> {
            self.inner.abort_put(key).await
        }
        async fn mark_pending_delete(&self, keys: &[String]) -> Result<u64> {
            self.inner.mark_pending_delete(keys).await
        }
        async fn delete_pending(&self, keys: &[String]) -> Result<u64> {
            let rows = self.inner.delete_pending(keys).await?;
            Ok(rows + self.extra_deleted_rows.load(Ordering::SeqCst))
        }
        async fn pending_delete_keys(&self) -> Result<Vec<String>> {
            self.inner.pending_delete_keys().await
        }
        async fn touch(&self, updates: &[TouchUpdate]) -> Result<()> {
            self.inner.touch(updates).await
        }
        async fn recency_page(
            &self,
            after: Option<&RecencyCursor>,
            limit: usize,
        ) -> Result<RecencyPage> {
            self.inner.recency_page(after, limit).await
        }
        async fn stale_page(
            &self,
            threshold_ms: u64,
            after: Option<i64>,
            limit: usize,
        ) -> Result<InsertionPage> {
            self.inner.stale_page(threshold_ms, after, limit).await
        }
        async fn entry(&self, key: &str) -> Result<Option<JournalEntry>> {
            self.inner.entry(key).await
        }
        async fn visible_size_sum(&self) -> Result<u64> {
            self.inner.visible_size_sum().await
        }
        async fn clear(&self) -> Result<()> {
            self.inner.clear().await
        }
    }

    struct Fixture {
        journal: Journal,
        clock: Arc<ManualClock>,
        receiver: mpsc::UnboundedReceiver<MaintenanceTask>,
    }

    async fn fixture_with(store: Arc<dyn JournalStore>, config: CacheConfig) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let (queue, receiver) = MaintenanceQueue::channel();
        let journal = Journal::new(store, clock.clone(), queue, &config);
        journal.open().await.unwrap();
        Fixture {
            journal,
            clock,
            receiver,
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteJournalStore::open_in_memory().await.unwrap());
        fixture_with(store, CacheConfig::default()).await
    }

    #[tokio::test]
    async fn test_mirror_tracks_puts_aborts_and_deletes() {
        let f = fixture().await;
        f.journal.record_put("a", 10).await.unwrap();
        f.journal.record_put("b", 20).await.unwrap();
        assert_eq!(f.journal.current_size_bytes(), 30);

        f.journal.abort_put("a").await.unwrap();
        f.journal.abort_put("a").await.unwrap();
        assert_eq!(f.journal.current_size_bytes(), 20);

        let keys = vec!["b".to_string()];
        assert_eq!(f.journal.mark_pending_delete(&keys).await.unwrap(), 20);
        assert_eq!(f.journal.current_size_bytes(), 0);
        assert_eq!(f.journal.pending_delete_keys().await.unwrap(), keys);
        assert_eq!(f.journal.delete(&keys).await.unwrap(), 1);
        assert_eq!(f.journal.visible_size_sum().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_repeated_put_does_not_double_count() {
        let f = fixture().await;
        f.journal.record_put("a", 10).await.unwrap();
        f.journal.record_put("a", 12).await.unwrap();
        assert_eq!(f.journal.current_size_bytes(), 12);
        assert_eq!(f.journal.visible_size_sum().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_failed_put_reverts_mirror() {
        let store = Arc::new(FailingStore::new().await);
        let f = fixture_with(store.clone(), CacheConfig::default()).await;
        f.journal.record_put("a", 10).await.unwrap();

        store.fail_puts.store(true, Ordering::SeqCst);
        assert!(f.journal.record_put("b", 99).await.is_err());
        assert_eq!(f.journal.current_size_bytes(), 10);
        assert_eq!(f.journal.visible_size_sum().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_delete_tolerates_fewer_rows_but_not_more() {
        let store = Arc::new(FailingStore::new().await);
        let f = fixture_with(store.clone(), CacheConfig::default()).await;
        f.journal.record_put("a", 10).await.unwrap();
        f.journal.record_put("b", 10).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string()];
        f.journal.mark_pending_delete(&keys[..1]).await.unwrap();
        // "b" was never marked, so only one row goes
        assert_eq!(f.journal.delete(&keys).await.unwrap(), 1);

        f.journal.mark_pending_delete(&keys[1..]).await.unwrap();
        store.extra_deleted_rows.store(1, Ordering::SeqCst);
        assert!(matches!(
            f.journal.delete(&keys[1..]).await,
            Err(CacheError::ConsistencyError(_))
        ));
    }

    #[tokio::test]
    async fn test_least_recently_used_pages_until_target() {
        let config = CacheConfig {
            scan_page_size: 1,
            ..CacheConfig::default()
        };
        let store = Arc::new(SqliteJournalStore::open_in_memory().await.unwrap());
        let f = fixture_with(store, config).await;

        for (key, size) in [("a", 10), ("b", 20), ("c", 5)] {
            f.journal.record_put(key, size).await.unwrap();
            f.clock.advance(10);
        }

        assert_eq!(f.journal.least_recently_used(0).await.unwrap(), Vec::<String>::new());
        assert_eq!(f.journal.least_recently_used(10).await.unwrap(), vec!["a"]);
        assert_eq!(f.journal.least_recently_used(11).await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            f.journal.least_recently_used(35).await.unwrap(),
            vec!["a", "b", "c"]
        );
    }

    #[tokio::test]
    async fn test_least_recently_used_exhaustion_is_fatal() {
        let f = fixture().await;
        f.journal.record_put("a", 10).await.unwrap();

        let err = f.journal.least_recently_used(11).await.unwrap_err();
        assert!(matches!(err, CacheError::ConsistencyError(_)));
    }

    #[tokio::test]
    async fn test_scans_stop_at_page_cap() {
        let config = CacheConfig {
            scan_page_size: 1,
            max_scan_pages: 2,
            ..CacheConfig::default()
        };
        let store = Arc::new(SqliteJournalStore::open_in_memory().await.unwrap());
        let f = fixture_with(store, config).await;
        for key in ["a", "b", "c", "d"] {
            f.journal.record_put(key, 1).await.unwrap();
        }

        assert!(matches!(
            f.journal.least_recently_used(4).await,
            Err(CacheError::ScanLimitExceeded(2))
        ));
        assert!(matches!(
            f.journal.stale_entries(u64::MAX >> 1).await,
            Err(CacheError::ScanLimitExceeded(2))
        ));
    }

    #[tokio::test]
    async fn test_stale_entries_respect_threshold() {
        let f = fixture().await;
        f.journal.record_put("old", 1).await.unwrap();
        f.clock.advance(1_000);
        f.journal.record_put("new", 1).await.unwrap();

        let stale = f.journal.stale_entries(1_500).await.unwrap();
        assert_eq!(stale, vec!["old"]);
    }

    #[tokio::test]
    async fn test_touches_are_batched_to_worker() {
        let config = CacheConfig {
            touch_buffer_size: 2,
            ..CacheConfig::default()
        };
        let store = Arc::new(SqliteJournalStore::open_in_memory().await.unwrap());
        let mut f = fixture_with(store, config).await;
        f.journal.record_put("a", 1).await.unwrap();
        f.journal.record_put("b", 1).await.unwrap();

        f.clock.set(5_000);
        f.journal.touch("a");
        f.journal.touch("a");
        assert!(f.receiver.try_recv().is_err());
        f.journal.touch("b");

        let batch = match f.receiver.try_recv().unwrap() {
            MaintenanceTask::FlushTouches(batch) => batch,
            other => panic!("unexpected task: {:?}", other),
        };
        assert_eq!(batch.len(), 2);
        f.journal.apply_touches(&batch).await.unwrap();
        assert_eq!(
            f.journal.entry("a").await.unwrap().unwrap().last_modified_ms,
            5_000
        );

        // Explicit flush ships a partial buffer
        f.journal.touch("a");
        f.journal.flush_touches();
        assert!(matches!(
            f.receiver.try_recv().unwrap(),
            MaintenanceTask::FlushTouches(batch) if batch.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_clear_zeroes_mirror() {
        let f = fixture().await;
        f.journal.record_put("a", 10).await.unwrap();
        f.journal.touch("a");
        f.journal.clear().await.unwrap();

        assert_eq!(f.journal.current_size_bytes(), 0);
        assert!(f.journal.entry("a").await.unwrap().is_none());
        assert_eq!(f.journal.touch_stats().buffered_keys, 0);
    }
}
