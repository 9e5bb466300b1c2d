//! Maintenance Worker
//!
//! The single serial background worker. Touch flushes, eviction passes and
//! recovery passes are queued as commands on one unbounded channel and executed
//! in FIFO order by one tokio task, so no two maintenance tasks ever run at the
//! same time. They may still race with foreground callers; that race is settled
//! by the per-key entry locks.
//!
//! Commands are idempotent: enqueuing `Evict` twice runs two passes, and the
//! second one re-checks its precondition before doing anything.

use crate::journal_store::TouchUpdate;
use crate::{CacheError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A queued maintenance command
#[derive(Debug)]
pub enum MaintenanceTask {
    /// Apply a batch of buffered last-modified updates
    FlushTouches(Vec<TouchUpdate>),
    /// Run one eviction pass (staleness, then size)
    Evict,
    /// Run one recovery pass
    Recover,
    /// Signalled once every task queued before it has finished
    Barrier(oneshot::Sender<()>),
}

impl MaintenanceTask {
    fn name(&self) -> &'static str {
        match self {
            MaintenanceTask::FlushTouches(_) => "flush_touches",
            MaintenanceTask::Evict => "evict",
            MaintenanceTask::Recover => "recover",
            MaintenanceTask::Barrier(_) => "barrier",
        }
    }
}

/// Sending half of the maintenance queue
#[derive(Debug, Clone)]
pub struct MaintenanceQueue {
    sender: mpsc::UnboundedSender<MaintenanceTask>,
}

impl MaintenanceQueue {
    /// Create the queue and the receiver the worker consumes
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MaintenanceTask>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Enqueue a task; never blocks
    pub fn enqueue(&self, task: MaintenanceTask) -> Result<()> {
        let name = task.name();
        self.sender.send(task).map_err(|_| {
            CacheError::WorkerStopped(format!("cannot enqueue {}: worker has exited", name))
        })
    }

    /// Wait until every task enqueued so far has run
    pub async fn barrier(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(MaintenanceTask::Barrier(tx))?;
        rx.await.map_err(|_| {
            CacheError::WorkerStopped("worker exited before reaching barrier".to_string())
        })
    }
}

/// Executes maintenance tasks on behalf of the worker
#[async_trait]
pub trait MaintenanceHandler: Send + Sync {
    /// Run one task. Barriers are handled by the worker and never reach here.
    async fn handle(&self, task: MaintenanceTask) -> Result<()>;
}

/// Snapshot of maintenance counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceStats {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub fatal_errors: u64,
    pub touch_flushes: u64,
    pub touches_applied: u64,
    pub eviction_runs: u64,
    pub entries_evicted: u64,
    pub stale_entries_evicted: u64,
    pub scan_limit_fallbacks: u64,
    pub recovery_runs: u64,
    pub temp_files_removed: u64,
    pub pending_deletes_completed: u64,
}

/// Atomic maintenance counters shared by the worker and the task handlers
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub fatal_errors: AtomicU64,
    pub touch_flushes: AtomicU64,
    pub touches_applied: AtomicU64,
    pub eviction_runs: AtomicU64,
    pub entries_evicted: AtomicU64,
    pub stale_entries_evicted: AtomicU64,
    pub scan_limit_fallbacks: AtomicU64,
    pub recovery_runs: AtomicU64,
    pub temp_files_removed: AtomicU64,
    pub pending_deletes_completed: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MaintenanceStats {
        MaintenanceStats {
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
            touch_flushes: self.touch_flushes.load(Ordering::Relaxed),
            touches_applied: self.touches_applied.load(Ordering::Relaxed),
            eviction_runs: self.eviction_runs.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
            stale_entries_evicted: self.stale_entries_evicted.load(Ordering::Relaxed),
            scan_limit_fallbacks: self.scan_limit_fallbacks.load(Ordering::Relaxed),
            recovery_runs: self.recovery_runs.load(Ordering::Relaxed),
            temp_files_removed: self.temp_files_removed.load(Ordering::Relaxed),
            pending_deletes_completed: self.pending_deletes_completed.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the worker task.
///
/// The worker holds only a weak reference to its handler and exits when the
/// handler is gone or every queue sender has been dropped. A failed task is
/// logged and counted; the worker moves on to the next one.
pub fn spawn_worker<H>(
    handler: Weak<H>,
    mut receiver: mpsc::UnboundedReceiver<MaintenanceTask>,
    metrics: std::sync::Arc<MaintenanceMetrics>,
) -> JoinHandle<()>
where
    H: MaintenanceHandler + 'static,
{
    tokio::spawn(async move {
        debug!("Maintenance worker started");
        while let Some(task) = receiver.recv().await {
            if let MaintenanceTask::Barrier(done) = task {
                let _ = done.send(());
                continue;
            }

            let Some(handler) = handler.upgrade() else {
                debug!("Maintenance handler dropped, stopping worker");
                break;
            };

            let name = task.name();
            match handler.handle(task).await {
                Ok(()) => {
                    MaintenanceMetrics::add(&metrics.tasks_completed, 1);
                }
                Err(e) if e.is_fatal() => {
                    MaintenanceMetrics::add(&metrics.tasks_failed, 1);
                    MaintenanceMetrics::add(&metrics.fatal_errors, 1);
                    error!("Maintenance task aborted on invariant violation: task={}, error={}", name, e);
                }
                Err(e) => {
                    MaintenanceMetrics::add(&metrics.tasks_failed, 1);
                    warn!("Maintenance task failed: task={}, error={}", name, e);
                }
            }
        }
        info!("Maintenance worker stopped");
    })
}
