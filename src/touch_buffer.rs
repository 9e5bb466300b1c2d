//! Touch Buffer
//!
//! RAM buffer for last-modified updates produced by cache hits. `get` is the hot
//! path and must never wait on a durable write, so hits are recorded here and
//! shipped to the maintenance worker in batches.
//!
//! Updates are deduplicated by key: touching the same key twice before a flush
//! yields a single update carrying the newest timestamp. A batch is released
//! when the number of distinct keys reaches the flush threshold, or on an
//! explicit drain.

use crate::journal_store::TouchUpdate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Statistics about the touch buffer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TouchBufferStats {
    /// Total touches recorded since creation
    pub touches_recorded: u64,
    /// Touches that replaced a pending update for the same key
    pub touches_coalesced: u64,
    /// Updates handed out in batches
    pub updates_drained: u64,
    /// Distinct keys currently buffered
    pub buffered_keys: usize,
}

/// Bounded, key-deduplicating buffer of last-modified updates
pub struct TouchBuffer {
    pending: Mutex<HashMap<String, u64>>,
    flush_threshold: usize,
    touches_recorded: AtomicU64,
    touches_coalesced: AtomicU64,
    updates_drained: AtomicU64,
}

impl TouchBuffer {
    /// Create a buffer that releases a batch once `flush_threshold` distinct keys are pending
    pub fn new(flush_threshold: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::with_capacity(flush_threshold)),
            flush_threshold: flush_threshold.max(1),
            touches_recorded: AtomicU64::new(0),
            touches_coalesced: AtomicU64::new(0),
            updates_drained: AtomicU64::new(0),
        }
    }

    /// Record a touch of `key` at `now_ms`.
    ///
    /// Returns a batch to flush when the buffer reached its threshold.
    pub fn record(&self, key: &str, now_ms: u64) -> Option<Vec<TouchUpdate>> {
        self.touches_recorded.fetch_add(1, Ordering::Relaxed);

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get_mut(key) {
            Some(existing) => {
                *existing = (*existing).max(now_ms);
                self.touches_coalesced.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                pending.insert(key.to_string(), now_ms);
            }
        }

        if pending.len() >= self.flush_threshold {
            let batch = Self::drain_locked(&mut pending);
            drop(pending);
            self.updates_drained
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!("Touch buffer reached threshold: keys={}", batch.len());
            Some(batch)
        } else {
            None
        }
    }

    /// Take every buffered update
    pub fn take_batch(&self) -> Vec<TouchUpdate> {
        let batch = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            Self::drain_locked(&mut pending)
        };
        self.updates_drained
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Drop every buffered update without flushing
    pub fn discard(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let discarded = pending.len();
        pending.clear();
        discarded
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TouchBufferStats {
        TouchBufferStats {
            touches_recorded: self.touches_recorded.load(Ordering::Relaxed),
            touches_coalesced: self.touches_coalesced.load(Ordering::Relaxed),
            updates_drained: self.updates_drained.load(Ordering::Relaxed),
            buffered_keys: self.len(),
        }
    }

    fn drain_locked(pending: &mut HashMap<String, u64>) -> Vec<TouchUpdate> {
        let mut batch: Vec<TouchUpdate> = pending
            .drain()
            .map(|(key, last_modified_ms)| TouchUpdate {
                key,
                last_modified_ms,
            })
            .collect();
        // Stable order keeps the write pattern predictable
        batch.sort_by(|a, b| a.key.cmp(&b.key));
        batch
    }
}
