// Location: src/utils/logging.rs

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, fmt::format::FmtSpan, EnvFilter};

use crate::{
    config::MonitoringConfig,
    error::{Result, ServiceError},
};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Prefix each line with a timestamp
    pub timestamps: bool,
    /// Whether to include source file and line
    pub source_location: bool,
    /// Whether to log span open/close events, e.g. one per query
    pub log_spans: bool,
    /// Output file path (None for stdout)
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            timestamps: true,
            source_location: false,
            log_spans: false,
            file_path: None,
        }
    }
}

impl From<&MonitoringConfig> for LogConfig {
    fn from(monitoring: &MonitoringConfig) -> Self {
        Self {
            level: monitoring.log_level.into(),
            ..Default::default()
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Only the first call has any effect; later calls return `Ok(())`.
pub fn setup_logging(config: LogConfig) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = install(config);
    });
    result
}

fn install(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .with_target(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    let installed = match config.file_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| logging_error(format!("failed to open {}: {}", path.display(), e)))?;

            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            if config.timestamps {
                builder.try_init()
            } else {
                builder.without_time().try_init()
            }
        }
        None if config.timestamps => builder.try_init(),
        None => builder.without_time().try_init(),
    };

    installed.map_err(|e| logging_error(format!("failed to set global subscriber: {}", e)))
}

fn logging_error(message: String) -> ServiceError {
    ServiceError::Configuration {
        parameter: "logging".to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_config_from_monitoring() {
        let monitoring = MonitoringConfig {
            enable_metrics: true,
            log_level: LogLevel::Debug,
        };
        let config = LogConfig::from(&monitoring);
        assert_eq!(config.level, Level::DEBUG);
        assert!(config.file_path.is_none());
    }

    #[test]
    fn test_setup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            level: Level::DEBUG,
            file_path: Some(dir.path().join("session.log")),
            ..Default::default()
        };

        assert!(setup_logging(config.clone()).is_ok());
        assert!(setup_logging(config).is_ok());
        tracing::info!(target: "llm_query_session", "logging ready");
    }
}
