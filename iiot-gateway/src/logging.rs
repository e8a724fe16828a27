//! Tracing subscriber setup.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{GatewayError, Result};

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Output is either
/// human-readable text or one JSON object per line, for log aggregation.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .try_init(),
    }
    .map_err(|e| GatewayError::Tracing(e.to_string()))
}

/// Apply a CLI log level override on top of the configured logging.
pub fn with_level_override(config: &LoggingConfig, level: Option<&str>) -> LoggingConfig {
    match level {
        Some(level) => LoggingConfig {
            level: level.to_string(),
            format: config.format,
        },
        None => config.clone(),
    }
}
