//! Subscriber setup for applications embedding the crate.
//!
//! The library only emits `tracing` events (fields `uri`, `seq`, `command`, `code`,
//! `ref_count`). Binaries and tests that want them printed install a subscriber here:
//! a `tracing_subscriber` registry with one fmt layer in the configured
//! [`LogFormat`] behind an [`EnvFilter`].
//!
//! `RUST_LOG` wins over the configured level when set. Otherwise events from this
//! crate pass at the configured level and everything else at `warn`.
//!
//! # Example
//! ```no_run
//! use iio_link::{config::LinkConfig, tracing_init};
//!
//! let config = LinkConfig::load()?;
//! tracing_init::install_from_config(&config)?;
//! tracing::info!("Application started");
//! # Ok::<(), iio_link::LinkError>(())
//! ```

use crate::config::{LinkConfig, LogFormat};
use crate::error::{LinkError, LinkResult};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Everything needed to build the subscriber.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Level for this crate's events
    pub level: Level,
    /// Line format
    pub format: LogFormat,
    /// Print `file:line` of each event
    pub source_location: bool,
    /// Print thread names (queue workers are named after `workers.thread_name`)
    pub thread_names: bool,
    /// Colour output (ignored for JSON)
    pub ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            source_location: false,
            thread_names: true,
            ansi: true,
        }
    }
}

impl LogSettings {
    /// Settings from the `[application]` section.
    pub fn from_config(config: &LinkConfig) -> LinkResult<Self> {
        let level = config
            .application
            .log_level
            .parse::<Level>()
            .map_err(|_| {
                LinkError::Configuration(format!(
                    "Invalid log_level '{}'",
                    config.application.log_level
                ))
            })?;
        Ok(Self {
            level,
            format: config.application.log_format,
            ..Self::default()
        })
    }

    /// Override the line format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle `file:line` output.
    pub fn with_source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }

    /// Toggle colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives(self.level)))
    }
}

/// Install a global subscriber built from `config`.
pub fn install_from_config(config: &LinkConfig) -> LinkResult<bool> {
    install(LogSettings::from_config(config)?)
}

/// Install a global subscriber.
///
/// Returns `false` without touching anything if a global subscriber already exists
/// (for example one set by a test harness).
pub fn install(settings: LogSettings) -> LinkResult<bool> {
    if tracing::dispatcher::has_been_set() {
        return Ok(false);
    }

    let base = fmt::layer()
        .with_file(settings.source_location)
        .with_line_number(settings.source_location)
        .with_thread_names(settings.thread_names);

    let layer = match settings.format {
        LogFormat::Pretty => base.pretty().with_ansi(settings.ansi).boxed(),
        LogFormat::Compact => base.compact().with_ansi(settings.ansi).boxed(),
        LogFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(settings.filter()))
        .try_init()
        .map_err(|e| LinkError::Configuration(format!("Failed to install subscriber: {e}")))?;
    Ok(true)
}

/// Filter directives: this crate at `level`, everything else at `warn`.
fn directives(level: Level) -> String {
    let crate_level = level.as_str().to_ascii_lowercase();
    if level > Level::WARN {
        // More verbose than warn
        format!("warn,iio_link={crate_level}")
    } else {
        crate_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_application_section() {
        let mut config = LinkConfig::default();
        config.application.log_level = "DEBUG".into();
        config.application.log_format = LogFormat::Json;

        let settings = LogSettings::from_config(&config).unwrap();
        assert_eq!(settings.level, Level::DEBUG);
        assert_eq!(settings.format, LogFormat::Json);
    }

    #[test]
    fn unknown_level_is_a_configuration_error() {
        let mut config = LinkConfig::default();
        config.application.log_level = "loud".into();
        assert!(matches!(
            LogSettings::from_config(&config),
            Err(LinkError::Configuration(_))
        ));
    }

    #[test]
    fn directives_scope_verbose_levels_to_crate() {
        assert_eq!(directives(Level::TRACE), "warn,iio_link=trace");
        assert_eq!(directives(Level::INFO), "warn,iio_link=info");
        assert_eq!(directives(Level::WARN), "warn");
        assert_eq!(directives(Level::ERROR), "error");
    }

    #[test]
    fn builder_overrides() {
        let settings = LogSettings::default()
            .with_format(LogFormat::Pretty)
            .with_source_location(true)
            .with_ansi(false);
        assert_eq!(settings.format, LogFormat::Pretty);
        assert!(settings.source_location);
        assert!(!settings.ansi);
    }
}
