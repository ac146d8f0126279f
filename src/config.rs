//! Configuration System using Figment
//!
//! Strongly-typed configuration for the worker pool, liveness pings and logging.
//! Configuration is loaded from:
//! 1. `config/iio_link.toml` (base configuration)
//! 2. Environment variables (prefixed with `IIO_LINK_`, sections split on `__`)
//!
//! Every field has a default, so an empty file (or no file) yields a usable config.
//!
//! # Example
//! ```no_run
//! use iio_link::config::LinkConfig;
//!
//! let config = LinkConfig::load()?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), iio_link::LinkError>(())
//! ```

use crate::error::{LinkError, LinkResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Worker pool settings
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Liveness ping settings
    #[serde(default)]
    pub ping: PingConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON for log collectors
    Json,
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Async worker threads (ping timers, async waiters)
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Upper bound on threads running blocking hardware calls
    #[serde(default = "default_max_blocking_threads")]
    pub max_blocking_threads: usize,
    /// Thread name prefix
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

/// Liveness ping configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingConfig {
    /// Whether connections should be pinged at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Time between ping attempts in milliseconds
    #[serde(default = "default_ping_interval")]
    pub interval_ms: u64,
    /// Skip a ping if a command completed less than this many milliseconds ago
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_ms: u64,
}

// Default value functions
fn default_name() -> String {
    "iio-link".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_threads() -> usize {
    2
}

fn default_max_blocking_threads() -> usize {
    16
}

fn default_thread_name() -> String {
    "iio-link-worker".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    5000
}

fn default_idle_threshold() -> u64 {
    2000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            max_blocking_threads: default_max_blocking_threads(),
            thread_name: default_thread_name(),
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_ping_interval(),
            idle_threshold_ms: default_idle_threshold(),
        }
    }
}

impl WorkerConfig {
    /// Reject sizes the runtime builder would panic on
    pub fn validate(&self) -> LinkResult<()> {
        if self.worker_threads == 0 {
            return Err(LinkError::Configuration(
                "workers.worker_threads must be at least 1".into(),
            ));
        }

        if self.max_blocking_threads == 0 {
            return Err(LinkError::Configuration(
                "workers.max_blocking_threads must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

impl PingConfig {
    /// Ping interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Idle threshold as a duration
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }
}

impl LinkConfig {
    /// Load configuration from `config/iio_link.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `IIO_LINK_`.
    /// Example: `IIO_LINK_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> LinkResult<Self> {
        Self::load_from("config/iio_link.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> LinkResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(LinkConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("IIO_LINK_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> LinkResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(LinkError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.workers.validate()?;

        if self.ping.enabled && self.ping.interval_ms == 0 {
            return Err(LinkError::Configuration(
                "ping.interval_ms must be greater than 0 when pings are enabled".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = LinkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ping.interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [application]
            log_level = "debug"
            log_format = "json"

            [ping]
            interval_ms = 250
            "#
        )
        .unwrap();

        let config = LinkConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.name, "iio-link");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.ping.interval_ms, 250);
        assert_eq!(config.ping.idle_threshold_ms, 2000);
        assert_eq!(config.workers, WorkerConfig::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = LinkConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config, LinkConfig::default());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LinkConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.workers.max_blocking_threads = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::default();
        config.workers.worker_threads = 0;
        assert!(matches!(config.validate(), Err(LinkError::Configuration(_))));

        let mut config = LinkConfig::default();
        config.ping.interval_ms = 0;
        assert!(config.validate().is_err());
        config.ping.enabled = false;
        assert!(config.validate().is_ok());
    }
}
