//! Disk Journal Cache - journaled, size-bounded, crash-recoverable disk cache
//!
//! A key-to-file store in which a durable SQLite journal, not the filesystem, is
//! the authority on which entries exist, their sizes and their recency.
//! Eviction and recovery run on a single serial background worker against that
//! journal, while callers get, put and delete concurrently under per-key locks.

pub mod cache;
pub mod clock;
pub mod config;
pub mod entry_lock_cache;
pub mod error;
pub mod eviction;
pub mod filesystem;
pub mod journal;
pub mod journal_store;
pub mod logging;
pub mod maintenance_worker;
pub mod recovery;
pub mod sqlite_journal_store;
pub mod touch_buffer;

pub use cache::{validate_key, CacheStats, DiskCache, PendingPut};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, Config, LoggingConfig};
pub use error::{CacheError, Result};
pub use filesystem::{FileSystem, LocalFileSystem};
pub use journal_store::{JournalEntry, JournalStore};
pub use sqlite_journal_store::SqliteJournalStore;
