//! Logging and tracing initialization
//!
//! Structured logging via the `tracing` ecosystem. The subscriber honors
//! `RUST_LOG` when set, falling back to the configured level; output format
//! is selected by configuration (json, compact, pretty).

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the global tracing subscriber.
///
/// # Errors
/// Fails on an invalid level string or when a subscriber is already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log level '{}': {e}", config.level)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    match config.format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init(),
        "compact" => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init(),
        _ => registry.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))
}
