//! Error Module
//!
//! Defines error types and result types used throughout the disk cache.

use thiserror::Error;

/// Main error type for the disk cache
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Journal error: {0}")]
    JournalError(String),

    /// The durable size counter and the journal rows have diverged.
    /// Never retried and never papered over.
    #[error("Consistency error: {0}")]
    ConsistencyError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Journal scan exceeded {0} pages")]
    ScanLimitExceeded(usize),

    /// An operation on a put handle that has already been released
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Maintenance worker stopped: {0}")]
    WorkerStopped(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CacheError {
    /// Whether this error signals a broken journal invariant
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CacheError::ConsistencyError(_) | CacheError::ScanLimitExceeded(_)
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        CacheError::JournalError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type alias for the disk cache
pub type Result<T> = std::result::Result<T, CacheError>;
