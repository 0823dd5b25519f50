//! # Configuration Management
//!
//! Centralized configuration for the protocol server.
//!
//! Time-valued settings are plain integers on disk (`*_ms`, `*_secs`) and
//! exposed as `Duration` through accessors, so the TOML surface stays free
//! of custom serde glue.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-variable overrides
//!
//! ## Security Considerations
//! - Default compression threshold (512 bytes) balances bandwidth and CPU
//! - Timeout defaults bound slowloris-style connections
//! - PBKDF2 round count is configuration, not wire-negotiable

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Top-level configuration with one section per concern.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Listener and lifecycle settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Wire-level transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Admission-control settings
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Credential-handling settings
    #[serde(default)]
    pub security: SecurityConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("REALM_PROTOCOL_ADDRESS") {
            config.server.address = addr;
        }
        if let Ok(depth) = std::env::var("REALM_PROTOCOL_DISPATCH_QUEUE_DEPTH") {
            if let Ok(val) = depth.parse::<usize>() {
                config.server.dispatch_queue_depth = val;
            }
        }
        if let Ok(timeout) = std::env::var("REALM_PROTOCOL_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.server.connection_timeout_ms = val;
            }
        }
        if let Ok(rounds) = std::env::var("REALM_PROTOCOL_PBKDF2_ROUNDS") {
            if let Ok(val) = rounds.parse::<u32>() {
                config.security.pbkdf2_rounds = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration.
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Validate the configuration for common misconfigurations.
    ///
    /// Returns a list of validation errors; empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.limits.validate());
        errors.extend(self.security.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener and connection lifecycle settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Per-connection dispatch queue depth; overflow drops the oldest frame
    pub dispatch_queue_depth: usize,

    /// Idle timeout for client connections, in milliseconds
    pub connection_timeout_ms: u64,

    /// Drain deadline for graceful shutdown, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl ServerConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            max_connections: 1000,
            dispatch_queue_depth: 32,
            connection_timeout_ms: 60_000,
            shutdown_timeout_ms: timeout::SHUTDOWN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Listen address '{}' is not a socket address (host:port)",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.dispatch_queue_depth == 0 {
            errors.push("Dispatch queue depth must be greater than 0".to_string());
        } else if self.dispatch_queue_depth > 10_000 {
            errors.push(format!(
                "Dispatch queue depth too large: {} (max recommended: 10,000)",
                self.dispatch_queue_depth
            ));
        }

        if !(100..=3_600_000).contains(&self.connection_timeout_ms) {
            errors.push(format!(
                "Connection timeout out of range: {}ms (expected 100ms to 1 hour)",
                self.connection_timeout_ms
            ));
        }

        if !(1_000..=60_000).contains(&self.shutdown_timeout_ms) {
            errors.push(format!(
                "Shutdown timeout out of range: {}ms (expected 1s to 60s)",
                self.shutdown_timeout_ms
            ));
        }

        errors
    }
}

/// Wire-level transport settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Whether outbound payloads may be compressed
    pub compression_enabled: bool,

    /// Minimum payload size (bytes) before compression is applied
    pub compression_threshold_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            compression_enabled: false,
            compression_threshold_bytes: 512,
        }
    }
}

/// Admission-control settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Token-bucket capacity per connection
    pub bucket_capacity: u32,

    /// Token-bucket refill rate per second
    pub bucket_refill_per_sec: u32,

    /// Process-wide cap on in-flight handler executions
    pub max_inflight_handlers: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 32,
            bucket_refill_per_sec: 16,
            max_inflight_handlers: 256,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bucket_capacity == 0 {
            errors.push("Token bucket capacity must be greater than 0".to_string());
        }
        if self.bucket_refill_per_sec == 0 {
            errors.push("Token bucket refill rate must be greater than 0".to_string());
        }
        if self.max_inflight_handlers == 0 {
            errors.push("Max in-flight handlers must be greater than 0".to_string());
        }

        errors
    }
}

/// Credential-handling settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// PBKDF2-HMAC-SHA256 iteration count
    pub pbkdf2_rounds: u32,

    /// Consecutive failures before an account locks
    pub lockout_threshold: u32,

    /// Lockout window after the last failure, in seconds
    pub lockout_window_secs: u64,
}

impl SecurityConfig {
    pub fn lockout_window(&self) -> Duration {
        Duration::from_secs(self.lockout_window_secs)
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pbkdf2_rounds: 100_000,
            lockout_threshold: 5,
            lockout_window_secs: 180,
        }
    }
}

impl SecurityConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.pbkdf2_rounds < 1_000 {
            errors.push(format!(
                "PBKDF2 round count too low: {} (minimum: 1,000)",
                self.pbkdf2_rounds
            ));
        }
        if self.lockout_threshold == 0 {
            errors.push("Lockout threshold must be greater than 0".to_string());
        }
        if self.lockout_window_secs == 0 {
            errors.push("Lockout window must be greater than 0".to_string());
        }

        errors
    }
}

/// Log verbosity, the on-disk spelling of a `tracing` level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Default directive for the env-filter when `RUST_LOG` is unset.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("realm-protocol"),
            log_level: LogLevel::Info,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() || self.app_name.len() > 64 {
            errors.push(format!(
                "Application name must be 1-64 characters, got {}",
                self.app_name.len()
            ));
        }

        match (self.log_to_file, self.log_file_path.as_deref()) {
            (true, None) => {
                errors.push("log_file_path must be set when log_to_file is enabled".to_string());
            }
            (true, Some(path)) => {
                let parent = Path::new(path).parent();
                if let Some(parent) = parent.filter(|p| !p.as_os_str().is_empty()) {
                    if !parent.exists() {
                        errors.push(format!(
                            "Log file parent directory is missing: {}",
                            parent.display()
                        ));
                    }
                }
            }
            _ => {}
        }

        if !(self.log_to_console || self.log_to_file) {
            errors.push("Logging must write somewhere: enable console or file output".to_string());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn toml_roundtrip() {
        let config = NetworkConfig::default();
        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed = NetworkConfig::from_toml(&text).expect("parse");
        assert_eq!(parsed.server.address, config.server.address);
        assert_eq!(parsed.security.pbkdf2_rounds, config.security.pbkdf2_rounds);
        assert_eq!(parsed.logging.log_level, config.logging.log_level);
    }

    #[test]
    fn durations_come_from_integer_fields() {
        let config = NetworkConfig::from_toml(
            "[server]\n\
             address = \"127.0.0.1:9100\"\n\
             max_connections = 10\n\
             dispatch_queue_depth = 8\n\
             connection_timeout_ms = 2500\n\
             shutdown_timeout_ms = 3000\n\
             [security]\n\
             pbkdf2_rounds = 5000\n\
             lockout_threshold = 3\n\
             lockout_window_secs = 90\n",
        )
        .expect("parse");
        assert_eq!(
            config.server.connection_timeout(),
            Duration::from_millis(2500)
        );
        assert_eq!(config.server.shutdown_timeout(), Duration::from_secs(3));
        assert_eq!(config.security.lockout_window(), Duration::from_secs(90));
    }

    #[test]
    fn log_level_spelling_is_lowercase() {
        let config =
            NetworkConfig::from_toml("[logging]\napp_name = \"x\"\nlog_level = \"warn\"\nlog_to_console = true\nlog_to_file = false\njson_format = false\n")
                .expect("parse");
        assert_eq!(config.logging.log_level, LogLevel::Warn);
        assert_eq!(Level::from(config.logging.log_level), Level::WARN);
    }

    #[test]
    fn bad_address_flagged() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.address = "not-an-address".into();
        });
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("not a socket address")));
    }

    #[test]
    fn zero_queue_depth_flagged() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.server.dispatch_queue_depth = 0;
        });
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn weak_pbkdf2_rounds_flagged() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.security.pbkdf2_rounds = 10;
        });
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("PBKDF2 round count too low")));
    }

    #[test]
    fn file_logging_requires_a_path() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.logging.log_to_file = true;
            c.logging.log_file_path = None;
        });
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("log_file_path must be set")));
    }
}
