//! Logging Module
//!
//! Installs the application `tracing` subscriber: a compact console layer and, when a log
//! directory is configured, a daily rolling file under a host-specific subdirectory.

use crate::{CounterError, Result};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging settings resolved at startup
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
    pub app_log_dir: Option<PathBuf>,
    pub hostname: String,
}

impl LoggingConfig {
    pub fn from_config(config: &crate::config::LoggingConfig) -> Self {
        Self {
            log_level: config.log_level.clone(),
            app_log_dir: config.app_log_dir.clone(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
        }
    }

    /// Directory the rolling file is written to, if file logging is enabled
    pub fn host_log_dir(&self) -> Option<PathBuf> {
        self.app_log_dir
            .as_ref()
            .map(|dir| dir.join(&self.hostname))
    }
}

pub struct LoggerManager {
    config: LoggingConfig,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Install the global subscriber.
    ///
    /// A subscriber that is already installed (as in tests) is left in place.
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

        let file_layer = match self.config.host_log_dir() {
            Some(host_log_dir) => {
                std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                    CounterError::IoError(format!(
                        "Failed to create app log directory {:?}: {}",
                        host_log_dir, e
                    ))
                })?;

                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, host_log_dir, "etcd-counter.log");

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
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
            Ok(()) => {
                info!(
                    "Application logging initialized for host: {}",
                    self.config.hostname
                );
                if let Some(dir) = self.config.host_log_dir() {
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
