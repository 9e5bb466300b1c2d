//! Configuration Module
//!
//! Handles configuration loading from YAML files and environment variables.
//! Durations are written as strings such as "30s", "5m" or "30d".

use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" | "" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "d" | "day" | "days" => Duration::from_secs_f64(value * 86400.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Name of the canary marker file inside the cache directory
pub const CANARY_FILE_NAME: &str = ".canary";

/// Suffix appended to a key to form its temporary file name
pub const TEMP_FILE_SUFFIX: &str = ".tmp";

/// Default journal file name when `journal_path` is not set
pub const DEFAULT_JOURNAL_FILE_NAME: &str = ".journal.db";

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_max_size_bytes() -> u64 {
    250 * 1024 * 1024
}

fn default_slop_fraction() -> f64 {
    0.05
}

fn default_slop_cap_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_stale_threshold() -> Duration {
    Duration::from_secs(30 * 86400)
}

fn default_touch_buffer_size() -> usize {
    128
}

fn default_inactive_lock_capacity() -> usize {
    2048
}

fn default_scan_page_size() -> usize {
    256
}

fn default_max_scan_pages() -> usize {
    4096
}

fn default_delete_batch_size() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Disk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the permanent and temporary data files
    #[serde(
        default = "default_cache_dir",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub cache_dir: PathBuf,

    /// SQLite journal file (default: `<cache_dir>/.journal.db`)
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub journal_path: Option<PathBuf>,

    /// Soft maximum size of the cache in bytes
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Fraction of the maximum tolerated above it before eviction is scheduled
    #[serde(default = "default_slop_fraction")]
    pub slop_fraction: f64,

    /// Absolute cap on the slop margin
    #[serde(default = "default_slop_cap_bytes")]
    pub slop_cap_bytes: u64,

    /// Entries untouched for longer than this are evicted regardless of size
    #[serde(
        default = "default_stale_threshold",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub stale_threshold: Duration,

    /// Distinct keys buffered before touch updates are flushed
    #[serde(default = "default_touch_buffer_size")]
    pub touch_buffer_size: usize,

    /// Capacity of the idle entry-lock LRU
    #[serde(default = "default_inactive_lock_capacity")]
    pub inactive_lock_capacity: usize,

    /// Rows fetched per journal page during LRU and staleness scans
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,

    /// Maximum pages a single scan may read
    #[serde(default = "default_max_scan_pages")]
    pub max_scan_pages: usize,

    /// Keys per mark-pending-delete transaction
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            journal_path: None,
            max_size_bytes: default_max_size_bytes(),
            slop_fraction: default_slop_fraction(),
            slop_cap_bytes: default_slop_cap_bytes(),
            stale_threshold: default_stale_threshold(),
            touch_buffer_size: default_touch_buffer_size(),
            inactive_lock_capacity: default_inactive_lock_capacity(),
            scan_page_size: default_scan_page_size(),
            max_scan_pages: default_max_scan_pages(),
            delete_batch_size: default_delete_batch_size(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration rooted at `cache_dir` with default limits
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    /// Resolved journal path
    pub fn journal_path(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| self.cache_dir.join(DEFAULT_JOURNAL_FILE_NAME))
    }

    /// Path of the canary marker
    pub fn canary_path(&self) -> PathBuf {
        self.cache_dir.join(CANARY_FILE_NAME)
    }

    /// Slop margin for a given maximum: min(max * fraction, cap)
    pub fn slop_bytes_for(&self, max_size_bytes: u64) -> u64 {
        let fractional = (max_size_bytes as f64 * self.slop_fraction) as u64;
        fractional.min(self.slop_cap_bytes)
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            CacheError::ConfigError(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        info!("Configuration loaded from file: {}", path.display());
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(cache_dir) = std::env::var("CACHE_DIR") {
            self.cache_dir = pathbuf_serde::expand_tilde(&cache_dir);
        }

        if let Ok(journal_path) = std::env::var("CACHE_JOURNAL_PATH") {
            self.journal_path = Some(pathbuf_serde::expand_tilde(&journal_path));
        }

        if let Ok(max_size) = std::env::var("CACHE_MAX_SIZE_BYTES") {
            if let Ok(max_size) = max_size.parse() {
                self.max_size_bytes = max_size;
            }
        }

        if let Ok(threshold) = std::env::var("CACHE_STALE_THRESHOLD") {
            match duration_serde::parse_duration(&threshold) {
                Ok(threshold) => self.stale_threshold = threshold,
                Err(e) => debug!("Ignoring CACHE_STALE_THRESHOLD override: {}", e),
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.slop_fraction) {
            return Err(CacheError::ConfigError(format!(
                "slop_fraction must be between 0 and 1, got {}",
                self.slop_fraction
            )));
        }

        let positive = [
            ("touch_buffer_size", self.touch_buffer_size),
            ("inactive_lock_capacity", self.inactive_lock_capacity),
            ("scan_page_size", self.scan_page_size),
            ("max_scan_pages", self.max_scan_pages),
            ("delete_batch_size", self.delete_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(CacheError::ConfigError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.journal_path() == self.cache_dir {
            return Err(CacheError::ConfigError(
                "journal_path must not be the cache directory itself".to_string(),
            ));
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for rolling application logs; console only when unset
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub app_log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            app_log_dir: None,
        }
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load a configuration document, then apply environment overrides and validate
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.cache.apply_env_overrides();
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.logging.log_level = log_level;
        }
        config.cache.validate()?;
        Ok(config)
    }
}
