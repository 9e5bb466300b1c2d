//! Entry Lock Cache
//!
//! Per-key shared/exclusive locks plus a cached existence state per key.
//!
//! A key's lock lives in the *active* table while it has at least one holder.
//! When the last holder releases it, the entry is demoted into a bounded LRU of
//! *inactive* entries. Only the cached existence state survives demotion; the
//! lock primitive itself is dropped, and a fresh one is created on the next
//! promotion. Active entries are never evicted, so a lock can never be lost
//! out from under a holder.
//!
//! Holder counts are explicit: acquiring increments the count under the table
//! mutex before waiting on the lock, and dropping the returned guard releases
//! the lock and then decrements the count.

use lru::LruCache;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

/// Cached knowledge about whether a key's permanent file exists
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EntryState {
    #[default]
    Unknown,
    Present(PathBuf),
    NotPresent,
}

struct ActiveEntry {
    lock: Arc<RwLock<()>>,
    holders: usize,
    state: EntryState,
}

struct LockTable {
    active: HashMap<String, ActiveEntry>,
    inactive: LruCache<String, EntryState>,
}

type SharedTable = Arc<Mutex<LockTable>>;

fn lock_table(table: &Mutex<LockTable>) -> std::sync::MutexGuard<'_, LockTable> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Occupancy of the lock cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntryLockStats {
    pub active: usize,
    pub inactive: usize,
    pub inactive_capacity: usize,
}

/// Table of per-key locks
pub struct EntryLockCache {
    table: SharedTable,
    inactive_capacity: usize,
}

impl EntryLockCache {
    pub fn new(inactive_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(inactive_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            table: Arc::new(Mutex::new(LockTable {
                active: HashMap::new(),
                inactive: LruCache::new(capacity),
            })),
            inactive_capacity: capacity.get(),
        }
    }

    /// Take `key` in shared mode
    pub async fn read(&self, key: &str) -> EntryLockGuard {
        let mut guard = self.promote(key);
        let lock = guard.lock.clone();
        guard.held = Some(HeldLock::Shared(lock.read_owned().await));
        guard
    }

    /// Take `key` in exclusive mode
    pub async fn write(&self, key: &str) -> EntryLockGuard {
        let mut guard = self.promote(key);
        let lock = guard.lock.clone();
        guard.held = Some(HeldLock::Exclusive(lock.write_owned().await));
        guard
    }

    /// Register a holder and return a guard that does not hold the lock yet.
    /// Dropping it before the lock is taken still releases the holder.
    fn promote(&self, key: &str) -> EntryLockGuard {
        let mut table = lock_table(&self.table);
        let lock = match table.active.get_mut(key) {
            Some(entry) => {
                entry.holders += 1;
                entry.lock.clone()
            }
            None => {
                let state = table.inactive.pop(key).unwrap_or_default();
                let lock = Arc::new(RwLock::new(()));
                table.active.insert(
                    key.to_string(),
                    ActiveEntry {
                        lock: lock.clone(),
                        holders: 1,
                        state,
                    },
                );
                lock
            }
        };

        EntryLockGuard {
            key: key.to_string(),
            lock,
            held: None,
            table: self.table.clone(),
        }
    }

    /// Forget every cached state.
    ///
    /// Inactive entries are dropped. Active entries keep their lock objects so
    /// current holders stay valid, but their states are reset to unknown.
    pub fn clear(&self) {
        let mut table = lock_table(&self.table);
        let inactive = table.inactive.len();
        table.inactive.clear();
        for entry in table.active.values_mut() {
            entry.state = EntryState::Unknown;
        }
        debug!(
            "Entry lock cache cleared: active={}, inactive_dropped={}",
            table.active.len(),
            inactive
        );
    }

    pub fn stats(&self) -> EntryLockStats {
        let table = lock_table(&self.table);
        EntryLockStats {
            active: table.active.len(),
            inactive: table.inactive.len(),
            inactive_capacity: self.inactive_capacity,
        }
    }
}

enum HeldLock {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// A held entry lock. Releases the lock and the holder count on drop.
pub struct EntryLockGuard {
    key: String,
    lock: Arc<RwLock<()>>,
    held: Option<HeldLock>,
    table: SharedTable,
}

impl EntryLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Some(HeldLock::Exclusive(_)))
    }

    /// Cached existence state of this key
    pub fn state(&self) -> EntryState {
        let table = lock_table(&self.table);
        table
            .active
            .get(&self.key)
            .filter(|entry| Arc::ptr_eq(&entry.lock, &self.lock))
            .map(|entry| entry.state.clone())
            .unwrap_or_default()
    }

    pub fn set_state(&self, state: EntryState) {
        let mut table = lock_table(&self.table);
        if let Some(entry) = table.active.get_mut(&self.key) {
            if Arc::ptr_eq(&entry.lock, &self.lock) {
                entry.state = state;
            }
        }
    }
}

impl Drop for EntryLockGuard {
    fn drop(&mut self) {
        // Release the primitive before the holder count so a waiter never sees a demoted entry
        self.held.take();

        let mut table = lock_table(&self.table);
        let demote = match table.active.get_mut(&self.key) {
            Some(entry) if Arc::ptr_eq(&entry.lock, &self.lock) => {
                entry.holders = entry.holders.saturating_sub(1);
                entry.holders == 0
            }
            _ => false,
        };

        if demote {
            if let Some(entry) = table.active.remove(&self.key) {
                table.inactive.put(self.key.clone(), entry.state);
            }
        }
    }
}

impl std::fmt::Debug for EntryLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLockGuard")
            .field("key", &self.key)
            .field("exclusive", &self.is_exclusive())
            .finish()
    }
}
