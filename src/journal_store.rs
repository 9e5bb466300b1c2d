//! Journal Store Module
//!
//! The narrow storage contract behind the durable journal. A store keeps one row
//! per cache key plus a single aggregate size counter, and every mutating call
//! applies the row change and the counter change in one transaction: either both
//! commit or neither does.

use crate::Result;
use async_trait::async_trait;

/// One journal row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified_ms: u64,
    pub pending_delete: bool,
}

/// Position after the last row of a recency-ordered page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecencyCursor {
    pub last_modified_ms: u64,
    pub key: String,
}

/// A page of recency-ordered rows
#[derive(Debug, Clone, Default)]
pub struct RecencyPage {
    pub entries: Vec<JournalEntry>,
    /// `None` when the scan is exhausted
    pub next: Option<RecencyCursor>,
}

/// A page of rows in insertion order
#[derive(Debug, Clone, Default)]
pub struct InsertionPage {
    pub entries: Vec<JournalEntry>,
    /// Insertion-order position to resume from; `None` when exhausted
    pub next: Option<i64>,
}

/// A buffered last-modified update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchUpdate {
    pub key: String,
    pub last_modified_ms: u64,
}

/// Durable transactional store for journal rows and the size counter
#[async_trait]
pub trait JournalStore: Send + Sync {
    /// Create tables if needed and return the persisted counter value
    async fn load_size(&self) -> Result<u64>;

    /// Upsert `key` as a visible row and add its size to the counter.
    ///
    /// Returns the size of a visible row that was replaced, whose bytes were
    /// subtracted from the counter in the same transaction.
    async fn record_put(&self, key: &str, size_bytes: u64, now_ms: u64) -> Result<Option<u64>>;

    /// Remove the visible row for `key` and subtract its size.
    ///
    /// Returns the removed size, or `None` when no visible row existed.
    async fn abort_put(&self, key: &str) -> Result<Option<u64>>;

    /// Flag the visible rows among `keys` as pending delete and subtract their
    /// sizes, in one transaction. Returns the bytes subtracted.
    async fn mark_pending_delete(&self, keys: &[String]) -> Result<u64>;

    /// Hard-remove pending-delete rows. No counter effect.
    async fn delete_pending(&self, keys: &[String]) -> Result<u64>;

    async fn pending_delete_keys(&self) -> Result<Vec<String>>;

    /// Apply last-modified updates to visible rows
    async fn touch(&self, updates: &[TouchUpdate]) -> Result<()>;

    /// Visible rows ordered by (last_modified, key), strictly after `after`
    async fn recency_page(&self, after: Option<&RecencyCursor>, limit: usize)
        -> Result<RecencyPage>;

    /// Visible rows older than `threshold_ms`, in insertion order, after `after`
    async fn stale_page(
        &self,
        threshold_ms: u64,
        after: Option<i64>,
        limit: usize,
    ) -> Result<InsertionPage>;

    async fn entry(&self, key: &str) -> Result<Option<JournalEntry>>;

    /// Sum of sizes over visible rows, recomputed from the rows themselves
    async fn visible_size_sum(&self) -> Result<u64>;

    /// Remove every row and zero the counter
    async fn clear(&self) -> Result<()>;
}
