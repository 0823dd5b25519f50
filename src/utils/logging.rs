//! Structured logging configuration.
//!
//! Builds a `tracing` subscriber from [`LoggingConfig`]: console and/or file
//! output, optional JSON formatting, level filtering via `RUST_LOG` with the
//! configured level as the default.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. The returned guard must stay alive for
/// the lifetime of the process when file logging is enabled; dropping it
/// flushes and stops the background writer.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path required when log_to_file is true".into())
        })?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer);
        if config.json_format {
            builder
                .json()
                .try_init()
                .map_err(|e| ProtocolError::ConfigError(e.to_string()))?;
        } else {
            builder
                .try_init()
                .map_err(|e| ProtocolError::ConfigError(e.to_string()))?;
        }
        return Ok(Some(guard));
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json_format {
        builder
            .json()
            .try_init()
            .map_err(|e| ProtocolError::ConfigError(e.to_string()))?;
    } else {
        builder
            .try_init()
            .map_err(|e| ProtocolError::ConfigError(e.to_string()))?;
    }
    Ok(None)
}
