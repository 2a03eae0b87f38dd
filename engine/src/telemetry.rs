//! Tracing subscriber setup
//!
//! The subscriber is process-global and installed exactly once, after the
//! configuration is loaded, so `core.log_level`, `core.log_format` and the
//! `--log` flag actually take effect. `RUST_LOG`, when set, overrides the
//! configured level.

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::errors::PipelineError;

/// Log line format, from `core.log_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable terminal output
    Pretty,
    /// One JSON object per line, for log collectors
    Json,
}

impl FromStr for LogFormat {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(PipelineError::Config(format!(
                "Invalid log format '{}'. Must be 'pretty' or 'json'",
                other
            ))),
        }
    }
}

/// Filter applied when `RUST_LOG` is absent: the configured level for
/// the crate and everything below it.
fn filter_directives(level: &str) -> String {
    format!("{},pulse_engine={}", level, level)
}

/// Install the global tracing subscriber.
///
/// A second installation returns an error instead of silently keeping
/// the old filter, so a dropped reconfiguration is visible at the call
/// site.
pub fn init(level: &str, format: LogFormat) -> Result<(), PipelineError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level)));

    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
    };

    installed.map_err(|e| {
        PipelineError::Config(format!("Failed to install tracing subscriber: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_covers_crate_and_dependencies() {
        assert_eq!(filter_directives("debug"), "debug,pulse_engine=debug");
        assert_eq!(filter_directives("warn"), "warn,pulse_engine=warn");
    }

    #[test]
    fn test_log_format_parses_known_values() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_reports_error() {
        // The first call may race other tests for the global slot; what
        // matters is that a repeat installation fails loudly instead of
        // no-opping.
        let _ = init("info", LogFormat::Pretty);
        assert!(init("info", LogFormat::Pretty).is_err());
    }
}
