//! SQLite Journal Store
//!
//! `JournalStore` backed by an embedded SQLite database in WAL mode. Two tables:
//! `entries` (one row per key, indexed on `(last_modified, key)`) and the
//! singleton `cache_size` counter row.

use crate::journal_store::{
    InsertionPage, JournalEntry, JournalStore, RecencyCursor, RecencyPage, TouchUpdate,
};
use crate::{CacheError, Result};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const SCHEMA_STATEMENTS: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS entries (
        key TEXT PRIMARY KEY NOT NULL,
        last_modified INTEGER NOT NULL,
        pending_delete INTEGER NOT NULL DEFAULT 0,
        size INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_entries_last_modified ON entries(last_modified, key)",
    "CREATE TABLE IF NOT EXISTS cache_size (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        size_bytes INTEGER NOT NULL
    )",
    "INSERT OR IGNORE INTO cache_size (id, size_bytes) VALUES (0, 0)",
];

const UPSERT_ENTRY: &str = "INSERT INTO entries (key, last_modified, pending_delete, size)
    VALUES (?, ?, 0, ?)
    ON CONFLICT(key) DO UPDATE SET
        last_modified = excluded.last_modified,
        pending_delete = 0,
        size = excluded.size";

type EntryRow = (String, i64, i64, i64);

fn to_entry((key, size, last_modified, pending_delete): EntryRow) -> JournalEntry {
    JournalEntry {
        key,
        size_bytes: size.max(0) as u64,
        last_modified_ms: last_modified.max(0) as u64,
        pending_delete: pending_delete != 0,
    }
}

/// `?, ?, ?` for an IN list of `count` keys
fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Apply `delta` to the counter row; the row must exist
async fn adjust_counter(conn: &mut SqliteConnection, delta: i64) -> Result<()> {
    if delta == 0 {
        return Ok(());
    }
    let result = sqlx::query("UPDATE cache_size SET size_bytes = size_bytes + ? WHERE id = 0")
        .bind(delta)
        .execute(conn)
        .await?;
    if result.rows_affected() != 1 {
        return Err(CacheError::ConsistencyError(format!(
            "size counter row missing: rows_affected={}",
            result.rows_affected()
        )));
    }
    Ok(())
}

/// SQLite-based journal store
pub struct SqliteJournalStore {
    pool: Pool<Sqlite>,
}

impl SqliteJournalStore {
    /// Open (creating if missing) the journal database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // One connection linearizes every transaction against the counter row.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        info!("Opened journal database: path={:?}", path);
        Ok(Self { pool })
    }

    /// Open a private in-memory journal
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JournalStore for SqliteJournalStore {
    async fn load_size(&self) -> Result<u64> {
        self.migrate().await?;
        let size: i64 = sqlx::query_scalar("SELECT size_bytes FROM cache_size WHERE id = 0")
            .fetch_one(&self.pool)
            .await?;
        if size < 0 {
            return Err(CacheError::ConsistencyError(format!(
                "persisted cache size is negative: {}",
                size
            )));
        }
        Ok(size as u64)
    }

    async fn record_put(&self, key: &str, size_bytes: u64, now_ms: u64) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await?;

        let previous: Option<i64> =
            sqlx::query_scalar("SELECT size FROM entries WHERE key = ? AND pending_delete = 0")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        sqlx::query(UPSERT_ENTRY)
            .bind(key)
            .bind(now_ms as i64)
            .bind(size_bytes as i64)
            .execute(&mut *tx)
            .await?;

        adjust_counter(&mut tx, size_bytes as i64 - previous.unwrap_or(0)).await?;
        tx.commit().await?;

        if let Some(previous) = previous {
            debug!(
                "Replaced stale journal row: key={}, old_size={}, new_size={}",
                key, previous, size_bytes
            );
        }
        Ok(previous.map(|size| size.max(0) as u64))
    }

    async fn abort_put(&self, key: &str) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await?;

        let size: Option<i64> =
            sqlx::query_scalar("SELECT size FROM entries WHERE key = ? AND pending_delete = 0")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(size) = size else {
            tx.rollback().await?;
            return Ok(None);
        };

        let result = sqlx::query("DELETE FROM entries WHERE key = ? AND pending_delete = 0")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() != 1 {
            return Err(CacheError::ConsistencyError(format!(
                "abort of key={} removed {} rows, expected 1",
                key,
                result.rows_affected()
            )));
        }

        adjust_counter(&mut tx, -size).await?;
        tx.commit().await?;
        Ok(Some(size.max(0) as u64))
    }

    async fn mark_pending_delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let in_list = placeholders(keys.len());
        let mut tx = self.pool.begin().await?;

        let sum_sql = format!(
            "SELECT COALESCE(SUM(size), 0) FROM entries WHERE pending_delete = 0 AND key IN ({})",
            in_list
        );
        let mut sum_query = sqlx::query_scalar::<_, i64>(&sum_sql);
        for key in keys {
            sum_query = sum_query.bind(key);
        }
        let bytes = sum_query.fetch_one(&mut *tx).await?;

        adjust_counter(&mut tx, -bytes).await?;

        let mark_sql = format!(
            "UPDATE entries SET pending_delete = 1 WHERE pending_delete = 0 AND key IN ({})",
            in_list
        );
        let mut mark_query = sqlx::query(&mark_sql);
        for key in keys {
            mark_query = mark_query.bind(key);
        }
        mark_query.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(bytes.max(0) as u64)
    }

    async fn delete_pending(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM entries WHERE pending_delete = 1 AND key IN ({})",
            placeholders(keys.len())
        );
        let mut query = sqlx::query(&sql);
        for key in keys {
            query = query.bind(key);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn pending_delete_keys(&self) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar("SELECT key FROM entries WHERE pending_delete = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    async fn touch(&self, updates: &[TouchUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for update in updates {
            sqlx::query(
                "UPDATE entries SET last_modified = ? WHERE key = ? AND pending_delete = 0",
            )
            .bind(update.last_modified_ms as i64)
            .bind(&update.key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn recency_page(
        &self,
        after: Option<&RecencyCursor>,
        limit: usize,
    ) -> Result<RecencyPage> {
        let rows: Vec<EntryRow> = match after {
            Some(cursor) => {
                sqlx::query_as(
                    "SELECT key, size, last_modified, pending_delete FROM entries
                     WHERE pending_delete = 0
                       AND (last_modified > ? OR (last_modified = ? AND key > ?))
                     ORDER BY last_modified ASC, key ASC
                     LIMIT ?",
                )
                .bind(cursor.last_modified_ms as i64)
                .bind(cursor.last_modified_ms as i64)
                .bind(&cursor.key)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT key, size, last_modified, pending_delete FROM entries
                     WHERE pending_delete = 0
                     ORDER BY last_modified ASC, key ASC
                     LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let entries: Vec<JournalEntry> = rows.into_iter().map(to_entry).collect();
        let next = if entries.len() == limit {
            entries.last().map(|last| RecencyCursor {
                last_modified_ms: last.last_modified_ms,
                key: last.key.clone(),
            })
        } else {
            None
        };
        Ok(RecencyPage { entries, next })
    }

    async fn stale_page(
        &self,
        threshold_ms: u64,
        after: Option<i64>,
        limit: usize,
    ) -> Result<InsertionPage> {
        let rows: Vec<(i64, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT rowid, key, size, last_modified, pending_delete FROM entries
             WHERE pending_delete = 0 AND last_modified < ? AND rowid > ?
             ORDER BY rowid ASC
             LIMIT ?",
        )
        .bind(threshold_ms as i64)
        .bind(after.unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let last_rowid = rows.last().map(|row| row.0);
        let full_page = rows.len() == limit;
        let entries = rows
            .into_iter()
            .map(|(_, key, size, last_modified, pending)| {
                to_entry((key, size, last_modified, pending))
            })
            .collect();

        Ok(InsertionPage {
            entries,
            next: if full_page { last_rowid } else { None },
        })
    }

    async fn entry(&self, key: &str) -> Result<Option<JournalEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT key, size, last_modified, pending_delete FROM entries WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(to_entry))
    }

    async fn visible_size_sum(&self) -> Result<u64> {
        let sum: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM entries WHERE pending_delete = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(sum.max(0) as u64)
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM entries").execute(&mut *tx).await?;
        sqlx::query("UPDATE cache_size SET size_bytes = 0 WHERE id = 0")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> SqliteJournalStore {
        let store = SqliteJournalStore::open_in_memory().await.unwrap();
        assert_eq!(store.load_size().await.unwrap(), 0);
        store
    }

    async fn persisted_size(store: &SqliteJournalStore) -> u64 {
        store.load_size().await.unwrap()
    }

    #[tokio::test]
    async fn test_record_put_and_abort_adjust_counter() {
        let store = open_store().await;

        assert_eq!(store.record_put("a", 10, 1).await.unwrap(), None);
        assert_eq!(store.record_put("b", 20, 2).await.unwrap(), None);
        assert_eq!(persisted_size(&store).await, 30);

        assert_eq!(store.abort_put("a").await.unwrap(), Some(10));
        assert_eq!(persisted_size(&store).await, 20);

        // Second abort is a silent no-op
        assert_eq!(store.abort_put("a").await.unwrap(), None);
        assert_eq!(persisted_size(&store).await, 20);
        assert!(store.entry("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_put_upsert_replaces_stale_row() {
        let store = open_store().await;

        store.record_put("a", 10, 1).await.unwrap();
        assert_eq!(store.record_put("a", 4, 5).await.unwrap(), Some(10));

        assert_eq!(persisted_size(&store).await, 4);
        let entry = store.entry("a").await.unwrap().unwrap();
        assert_eq!(entry.size_bytes, 4);
        assert_eq!(entry.last_modified_ms, 5);
    }

    #[tokio::test]
    async fn test_mark_pending_delete_then_delete() {
        let store = open_store().await;
        store.record_put("a", 10, 1).await.unwrap();
        store.record_put("b", 20, 2).await.unwrap();

        let keys = vec!["a".to_string(), "missing".to_string()];
        assert_eq!(store.mark_pending_delete(&keys).await.unwrap(), 10);
        assert_eq!(persisted_size(&store).await, 20);
        assert_eq!(store.visible_size_sum().await.unwrap(), 20);
        assert_eq!(store.pending_delete_keys().await.unwrap(), vec!["a".to_string()]);

        // Marking again excludes nothing further
        assert_eq!(store.mark_pending_delete(&keys).await.unwrap(), 0);
        // Pending rows cannot be aborted
        assert_eq!(store.abort_put("a").await.unwrap(), None);

        // Visible rows are never hard-removed by delete_pending
        let all = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.delete_pending(&all).await.unwrap(), 1);
        assert!(store.entry("a").await.unwrap().is_none());
        assert!(store.entry("b").await.unwrap().is_some());
        assert_eq!(persisted_size(&store).await, 20);
    }

    #[tokio::test]
    async fn test_record_put_revives_pending_row() {
        let store = open_store().await;
        store.record_put("a", 10, 1).await.unwrap();
        store.mark_pending_delete(&["a".to_string()]).await.unwrap();

        assert_eq!(store.record_put("a", 7, 3).await.unwrap(), None);
        assert_eq!(persisted_size(&store).await, 7);
        assert!(!store.entry("a").await.unwrap().unwrap().pending_delete);
    }

    #[tokio::test]
    async fn test_recency_paging_orders_by_time_then_key() {
        let store = open_store().await;
        store.record_put("c", 1, 100).await.unwrap();
        store.record_put("b", 1, 100).await.unwrap();
        store.record_put("a", 1, 300).await.unwrap();
        store.record_put("d", 1, 50).await.unwrap();

        let first = store.recency_page(None, 2).await.unwrap();
        let keys: Vec<_> = first.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["d", "b"]);

        let cursor = first.next.unwrap();
        let second = store.recency_page(Some(&cursor), 2).await.unwrap();
        let keys: Vec<_> = second.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a"]);

        let cursor = second.next.unwrap();
        let third = store.recency_page(Some(&cursor), 2).await.unwrap();
        assert!(third.entries.is_empty());
        assert!(third.next.is_none());
    }

    #[tokio::test]
    async fn test_stale_page_uses_insertion_order() {
        let store = open_store().await;
        store.record_put("z", 1, 10).await.unwrap();
        store.record_put("y", 1, 500).await.unwrap();
        store.record_put("x", 1, 5).await.unwrap();

        let page = store.stale_page(100, None, 10).await.unwrap();
        let keys: Vec<_> = page.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["z", "x"]);
        assert!(page.next.is_none());

        let page = store.stale_page(1_000, None, 1).await.unwrap();
        assert_eq!(page.entries[0].key, "z");
        let page = store.stale_page(1_000, page.next, 1).await.unwrap();
        assert_eq!(page.entries[0].key, "y");
    }

    #[tokio::test]
    async fn test_touch_updates_visible_rows_only() {
        let store = open_store().await;
        store.record_put("a", 1, 10).await.unwrap();
        store.record_put("b", 1, 10).await.unwrap();
        store.mark_pending_delete(&["b".to_string()]).await.unwrap();

        store
            .touch(&[
                TouchUpdate {
                    key: "a".to_string(),
                    last_modified_ms: 99,
                },
                TouchUpdate {
                    key: "b".to_string(),
                    last_modified_ms: 99,
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.entry("a").await.unwrap().unwrap().last_modified_ms, 99);
        assert_eq!(store.entry("b").await.unwrap().unwrap().last_modified_ms, 10);
    }

    #[tokio::test]
    async fn test_clear_resets_counter() {
        let store = open_store().await;
        store.record_put("a", 10, 1).await.unwrap();
        store.record_put("b", 10, 1).await.unwrap();
        store.clear().await.unwrap();

        assert_eq!(persisted_size(&store).await, 0);
        assert!(store.entry("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counter_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("journal.db");
        {
            let store = SqliteJournalStore::open(&path).await.unwrap();
            store.load_size().await.unwrap();
            store.record_put("a", 42, 1).await.unwrap();
            store.record_put("b", 8, 2).await.unwrap();
            store.mark_pending_delete(&["b".to_string()]).await.unwrap();
        }

        let store = SqliteJournalStore::open(&path).await.unwrap();
        assert_eq!(store.load_size().await.unwrap(), 42);
        assert_eq!(store.pending_delete_keys().await.unwrap(), vec!["b".to_string()]);
    }
}
