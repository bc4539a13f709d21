use std::sync::OnceLock;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use super::config::{LogFormat, LogLevel};

/// Targets quieted to `warn` unless `RUST_LOG` says otherwise.
const DEFAULT_DIRECTIVES: &[&str] = &["hyper=warn", "reqwest=warn", "h2=warn"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {message}")]
    InvalidFilter { filter: String, message: String },
    #[error("Failed to set global tracing subscriber: {0}")]
    AlreadySet(String),
}

static INIT: OnceLock<Result<(), LoggingError>> = OnceLock::new();

/// Filter string for a level plus the default quieting directives.
pub fn build_filter_string(level: LogLevel) -> String {
    let mut parts = Vec::with_capacity(DEFAULT_DIRECTIVES.len() + 1);
    parts.push(level.as_str());
    parts.extend_from_slice(DEFAULT_DIRECTIVES);
    parts.join(",")
}

fn env_filter(level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let filter = build_filter_string(level);
    EnvFilter::try_new(&filter).map_err(|e| LoggingError::InvalidFilter {
        filter,
        message: e.to_string(),
    })
}

/// Installs the global subscriber.
///
/// Only the first call installs anything; later calls return that first
/// outcome.
pub fn setup_logging(level: LogLevel, format: LogFormat) -> Result<(), LoggingError> {
    INIT.get_or_init(|| {
        let filter = env_filter(level)?;
        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Compact => tracing::subscriber::set_global_default(
                registry.with(fmt::layer().with_target(true).compact()),
            ),
            LogFormat::Json => tracing::subscriber::set_global_default(
                registry.with(fmt::layer().json().with_current_span(false)),
            ),
        };
        installed.map_err(|e| LoggingError::AlreadySet(e.to_string()))
    })
    .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_string_quiets_http_stack() {
        assert_eq!(
            build_filter_string(LogLevel::Debug),
            "debug,hyper=warn,reqwest=warn,h2=warn"
        );
    }

    #[test]
    fn default_filter_parses_for_every_level() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert!(EnvFilter::try_new(build_filter_string(level)).is_ok());
        }
    }

    #[test]
    fn setup_is_idempotent() {
        let first = setup_logging(LogLevel::Info, LogFormat::Compact);
        let second = setup_logging(LogLevel::Trace, LogFormat::Json);
        assert_eq!(first, second);
    }
}
