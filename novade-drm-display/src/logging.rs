//! Logging setup built on the `tracing` ecosystem.
//!
//! The display session itself only emits `tracing` events; these helpers
//! install a subscriber for processes that do not bring their own.

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::DisplayError;

/// Initializes a minimal logging setup, directing messages to `stderr`.
///
/// Filters by `RUST_LOG`, defaulting to "info". Errors (e.g. a global
/// subscriber already being set) are ignored.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .try_init();
}

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Errors
///
/// `DisplayError::Logging` if the level is unknown or a global subscriber is
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<(), DisplayError> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        invalid => {
            return Err(DisplayError::Logging(format!("Invalid log level in config: {}", invalid)));
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let result = match config.format.to_lowercase().as_str() {
        "json" => fmt::Subscriber::builder()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init(),
        _ => fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .try_init(),
    };

    result.map_err(|e| {
        DisplayError::Logging(format!(
            "Failed to set global tracing subscriber. Was it already initialized? Error: {}",
            e
        ))
    })
}
