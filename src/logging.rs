//! Logging Module
//!
//! Installs the application `tracing` subscriber: a compact console layer and,
//! when a log directory is configured, a daily-rolling file layer partitioned
//! by host name.

use crate::config::LoggingConfig;
use crate::{CacheError, Result};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file prefix used by the rolling appender
const LOG_FILE_PREFIX: &str = "disk-cache.log";

/// Logger manager for the application log
pub struct LoggerManager {
    pub config: LoggingConfig,
    hostname: String,
}

impl LoggerManager {
    /// Create a new logger manager
    pub fn new(config: LoggingConfig) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        Self { config, hostname }
    }

    /// Create a logger manager with an explicit host name
    pub fn with_hostname(config: LoggingConfig, hostname: String) -> Self {
        Self { config, hostname }
    }

    /// Directory the rolling file layer writes into, if any
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.config
            .app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }

    /// Initialize the logging system
    ///
    /// A subscriber that is already installed (tests, embedding applications)
    /// is left in place.
    pub fn initialize(&self) -> Result<()> {
        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let file_layer = match self.host_log_dir() {
            Some(host_log_dir) => {
                std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                    CacheError::IoError(format!("Failed to create app log directory: {}", e))
                })?;
                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, host_log_dir, LOG_FILE_PREFIX);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .try_init();

        match result {
            Ok(_) => {
                info!("Application logging initialized for host: {}", self.hostname);
                if let Some(dir) = self.host_log_dir() {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }
}
