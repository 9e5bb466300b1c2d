//! Filesystem collaborator
//!
//! Literal wrappers over the filesystem primitives the cache needs. No caching
//! and no retries: every error is surfaced to the caller of that one call, which
//! decides whether it is absorbed, logged, or propagated.

use std::fs::{File, FileTimes, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use walkdir::WalkDir;

/// Filesystem operations used by the cache orchestrator and recovery
pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn delete(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn length(&self, path: &Path) -> io::Result<u64>;

    /// Create an empty file, truncating any existing content
    fn create_file(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn delete_recursive(&self, path: &Path) -> io::Result<()>;

    fn set_modified_time(&self, path: &Path, modified_ms: u64) -> io::Result<()>;

    /// Total size in bytes of every regular file below `path`
    fn directory_size(&self, path: &Path) -> io::Result<u64>;

    /// Immediate children of a directory
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
}

/// `FileSystem` over `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl FileSystem for LocalFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn length(&self, path: &Path) -> io::Result<u64> {
        std::fs::metadata(path).map(|m| m.len())
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        File::create(path).map(|_| ())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn delete_recursive(&self, path: &Path) -> io::Result<()> {
        if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        }
    }

    fn set_modified_time(&self, path: &Path, modified_ms: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path)?;
        let modified = UNIX_EPOCH + Duration::from_millis(modified_ms);
        file.set_times(FileTimes::new().set_modified(modified))
    }

    fn directory_size(&self, path: &Path) -> io::Result<u64> {
        let mut total = 0u64;
        for entry in WalkDir::new(path) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(io::Error::from)?.len();
            }
        }
        Ok(total)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut children = Vec::new();
        for entry in std::fs::read_dir(path)? {
            children.push(entry?.path());
        }
        Ok(children)
    }
}
