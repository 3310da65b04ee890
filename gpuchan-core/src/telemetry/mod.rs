//! Tracing setup
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and a text
//! or JSON formatting layer. `RUST_LOG` takes precedence over the configured
//! level.

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Build the filter for `config`, preferring `RUST_LOG` when set.
///
/// # Errors
/// Returns a configuration error if the configured level is not a valid directive.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            Error::Configuration(format!("Invalid log level {:?}: {e}", config.level))
        }),
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` if a subscriber was already installed, which happens
/// when several channels or tests initialise tracing in one process.
///
/// # Errors
/// Returns a configuration error if the filter cannot be built.
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let filter = env_filter(config)?;

    let fmt_layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .boxed(),
    };

    let installed = tracing_subscriber::registry().with(fmt_layer.with_filter(filter)).try_init().is_ok();
    if installed {
        info!(format = ?config.format, level = %config.level, "Tracing initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert_eq!(init_tracing(&config).ok(), Some(false));
    }
}
