//! Recovery Manager
//!
//! Repairs the cache after an unclean stop. Runs on the maintenance worker once
//! per open, and on demand:
//!
//! 1. Every `<key>.tmp` file in the cache directory is an interrupted write.
//!    The file is deleted under the key's write lock, then the key goes through
//!    the normal delete path so any journal row the write left behind is removed.
//! 2. Every journal row still flagged pending delete is an interrupted delete,
//!    and goes through the delete path again.
//!
//! Both steps are idempotent, so running recovery on a healthy cache is harmless.

use crate::config::TEMP_FILE_SUFFIX;
use crate::entry_lock_cache::EntryLockCache;
use crate::eviction::EntryDeleter;
use crate::filesystem::FileSystem;
use crate::journal::Journal;
use crate::maintenance_worker::MaintenanceMetrics;
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Keys whose temporary file was removed
    pub temp_files_removed: Vec<String>,
    /// Temporary files that could not be deleted; retried on the next pass
    pub temp_files_failed: usize,
    /// Pending-delete keys whose cleanup completed
    pub pending_deletes_completed: Vec<String>,
}

/// Key a temporary file belongs to, or `None` for any other file
pub(crate) fn key_for_temp_file(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    let key = name.strip_suffix(TEMP_FILE_SUFFIX)?;
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

/// Startup repair of interrupted writes and deletes
pub struct RecoveryManager {
    cache_dir: PathBuf,
    fs: Arc<dyn FileSystem>,
    locks: Arc<EntryLockCache>,
    journal: Arc<Journal>,
}

impl RecoveryManager {
    pub fn new(
        cache_dir: PathBuf,
        fs: Arc<dyn FileSystem>,
        locks: Arc<EntryLockCache>,
        journal: Arc<Journal>,
    ) -> Self {
        Self {
            cache_dir,
            fs,
            locks,
            journal,
        }
    }

    /// Run one recovery pass. Called on the maintenance worker.
    pub async fn run(
        &self,
        deleter: &dyn EntryDeleter,
        metrics: &MaintenanceMetrics,
    ) -> Result<RecoveryReport> {
        MaintenanceMetrics::add(&metrics.recovery_runs, 1);
        let mut report = RecoveryReport::default();

        let (removed, failed) = self.remove_temp_files().await?;
        report.temp_files_failed = failed;
        if !removed.is_empty() {
            deleter.delete_entries(&removed).await?;
        }
        MaintenanceMetrics::add(&metrics.temp_files_removed, removed.len() as u64);
        report.temp_files_removed = removed;

        let pending = self.journal.pending_delete_keys().await?;
        if !pending.is_empty() {
            debug!("Recovery retrying interrupted deletes: keys={}", pending.len());
            report.pending_deletes_completed = deleter.delete_entries(&pending).await?;
        }
        MaintenanceMetrics::add(
            &metrics.pending_deletes_completed,
            report.pending_deletes_completed.len() as u64,
        );

        if !report.temp_files_removed.is_empty()
            || report.temp_files_failed > 0
            || !report.pending_deletes_completed.is_empty()
        {
            info!(
                "Recovery pass completed: temp_files_removed={}, temp_files_failed={}, pending_deletes_completed={}",
                report.temp_files_removed.len(),
                report.temp_files_failed,
                report.pending_deletes_completed.len()
            );
        }
        Ok(report)
    }

    /// Delete orphaned temporary files, each under its key's write lock
    async fn remove_temp_files(&self) -> Result<(Vec<String>, usize)> {
        let mut removed = Vec::new();
        let mut failed = 0usize;

        for path in self.fs.list_dir(&self.cache_dir)? {
            let Some(key) = key_for_temp_file(&path) else {
                continue;
            };

            let guard = self.locks.write(&key).await;
            // A put that was in flight when the directory was listed may have finished since
            if !self.fs.exists(&path) {
                continue;
            }
            match self.fs.delete(&path) {
                Ok(()) => {
                    debug!("Removed orphaned temp file: key={}, path={:?}", key, path);
                    removed.push(key);
                }
                Err(e) => {
                    warn!(
                        "Failed to remove orphaned temp file, leaving for next recovery: key={}, path={:?}, error={}",
                        key, path, e
                    );
                    failed += 1;
                }
            }
            drop(guard);
        }

        Ok((removed, failed))
    }
}
