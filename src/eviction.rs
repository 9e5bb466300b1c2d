//! Eviction Manager
//!
//! Keeps the journaled cache size under a soft maximum. Scheduling compares the
//! in-memory size against `maximum + slop` and enqueues an `Evict` command on
//! the maintenance worker; the pass itself runs on that worker and always uses
//! whatever maximum is current when it executes.
//!
//! A pass first removes entries older than the staleness threshold, then, if
//! the cache is still above its maximum, removes least recently used entries
//! until the size drops to `maximum - slop`.

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::journal::Journal;
use crate::maintenance_worker::{MaintenanceMetrics, MaintenanceQueue, MaintenanceTask};
use crate::{CacheError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Removes entries on behalf of background maintenance.
///
/// Implemented by the cache orchestrator so eviction and recovery go through
/// the same locked delete path as foreground callers.
#[async_trait]
pub trait EntryDeleter: Send + Sync {
    /// Delete `keys`, returning the keys whose files are gone afterwards
    async fn delete_entries(&self, keys: &[String]) -> Result<Vec<String>>;

    /// Wipe every entry
    async fn clear_all(&self) -> Result<()>;
}

/// Outcome of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub size_before: u64,
    pub size_after: u64,
    pub stale_evicted: Vec<String>,
    pub lru_evicted: Vec<String>,
    /// The pass hit the scan page cap and fell back to a full clear
    pub cleared: bool,
}

/// Size-bounded eviction scheduling and execution
pub struct EvictionManager {
    journal: Arc<Journal>,
    clock: Arc<dyn Clock>,
    queue: MaintenanceQueue,
    maximum_size_bytes: AtomicU64,
    /// Source of the slop formula and staleness threshold
    config: CacheConfig,
    eviction_queued: AtomicBool,
}

impl EvictionManager {
    pub fn new(
        config: &CacheConfig,
        journal: Arc<Journal>,
        clock: Arc<dyn Clock>,
        queue: MaintenanceQueue,
    ) -> Self {
        Self {
            journal,
            clock,
            queue,
            maximum_size_bytes: AtomicU64::new(config.max_size_bytes),
            config: config.clone(),
            eviction_queued: AtomicBool::new(false),
        }
    }

    pub fn maximum_size_bytes(&self) -> u64 {
        self.maximum_size_bytes.load(Ordering::SeqCst)
    }

    /// Slop margin for the current maximum
    pub fn slop_bytes(&self) -> u64 {
        self.config.slop_bytes_for(self.maximum_size_bytes())
    }

    pub fn stale_threshold(&self) -> Duration {
        self.config.stale_threshold
    }

    fn over_threshold(&self) -> bool {
        let limit = self
            .maximum_size_bytes()
            .saturating_add(self.slop_bytes());
        self.journal.current_size_bytes() > limit
    }

    /// Enqueue an eviction pass if the cache is above `maximum + slop`.
    ///
    /// Redundant calls are cheap: while a pass is queued but not yet started,
    /// further calls do not enqueue another one. Returns whether a pass was queued.
    pub fn maybe_schedule_eviction(&self) -> bool {
        if !self.over_threshold() {
            return false;
        }

        if self
            .eviction_queued
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Eviction already queued, skipping");
            return false;
        }

        match self.queue.enqueue(MaintenanceTask::Evict) {
            Ok(()) => {
                debug!(
                    "Eviction scheduled: current_size={}, max_size={}, slop={}",
                    self.journal.current_size_bytes(),
                    self.maximum_size_bytes(),
                    self.slop_bytes()
                );
                true
            }
            Err(e) => {
                self.eviction_queued.store(false, Ordering::SeqCst);
                warn!("Failed to schedule eviction: {}", e);
                false
            }
        }
    }

    /// Enqueue an eviction pass regardless of the current size
    pub fn trigger_eviction(&self) -> Result<()> {
        self.queue.enqueue(MaintenanceTask::Evict)
    }

    /// Change the maximum. A decrease immediately runs a scheduling check
    /// against the new maximum. Returns the previous maximum.
    pub fn set_maximum_size_bytes(&self, maximum_size_bytes: u64) -> u64 {
        let previous = self
            .maximum_size_bytes
            .swap(maximum_size_bytes, Ordering::SeqCst);
        info!(
            "Maximum cache size changed: previous={}, new={}",
            previous, maximum_size_bytes
        );
        if maximum_size_bytes < previous {
            self.maybe_schedule_eviction();
        }
        previous
    }

    /// Run one eviction pass. Called on the maintenance worker.
    pub async fn run(
        &self,
        deleter: &dyn EntryDeleter,
        metrics: &MaintenanceMetrics,
    ) -> Result<EvictionReport> {
        // Growth from here on must be able to schedule a fresh pass
        self.eviction_queued.store(false, Ordering::SeqCst);
        MaintenanceMetrics::add(&metrics.eviction_runs, 1);

        match self.run_passes(deleter, metrics).await {
            Err(CacheError::ScanLimitExceeded(pages)) => {
                error!(
                    "Eviction scan exceeded page cap, clearing cache: max_scan_pages={}",
                    pages
                );
                MaintenanceMetrics::add(&metrics.scan_limit_fallbacks, 1);
                let size_before = self.journal.current_size_bytes();
                deleter.clear_all().await?;
                Ok(EvictionReport {
                    size_before,
                    size_after: self.journal.current_size_bytes(),
                    cleared: true,
                    ..EvictionReport::default()
                })
            }
            other => other,
        }
    }

    async fn run_passes(
        &self,
        deleter: &dyn EntryDeleter,
        metrics: &MaintenanceMetrics,
    ) -> Result<EvictionReport> {
        let size_before = self.journal.current_size_bytes();

        let stale_threshold_ms = self.stale_threshold().as_millis() as u64;
        let stale_deadline = self.clock.now_millis().saturating_sub(stale_threshold_ms);
        let stale_keys = self.journal.stale_entries(stale_deadline).await?;
        let stale_evicted = if stale_keys.is_empty() {
            Vec::new()
        } else {
            deleter.delete_entries(&stale_keys).await?
        };
        MaintenanceMetrics::add(&metrics.stale_entries_evicted, stale_evicted.len() as u64);

        let maximum = self.maximum_size_bytes();
        let current = self.journal.current_size_bytes();
        let mut lru_evicted = Vec::new();
        if current > maximum {
            // The target is at least one byte, so an over-maximum cache with no
            // evictable rows fails inside the scan with a consistency error
            let target = current - maximum.saturating_sub(self.slop_bytes());
            let lru_keys = self.journal.least_recently_used(target).await?;
            lru_evicted = deleter.delete_entries(&lru_keys).await?;
        }
        MaintenanceMetrics::add(&metrics.entries_evicted, lru_evicted.len() as u64);

        let size_after = self.journal.current_size_bytes();
        if !stale_evicted.is_empty() || !lru_evicted.is_empty() {
            info!(
                "Eviction pass completed: stale_evicted={}, lru_evicted={}, size_before={}, size_after={}",
                stale_evicted.len(),
                lru_evicted.len(),
                size_before,
                size_after
            );
        }

        Ok(EvictionReport {
            size_before,
            size_after,
            stale_evicted,
            lru_evicted,
            cleared: false,
        })
    }
}
