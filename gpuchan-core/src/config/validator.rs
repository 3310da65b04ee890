//! # Configuration Validation
//!
//! Field-level checks come from the `validator` derives on the schema; the
//! cross-field rules of the preemption timings live here.

use crate::{
    config::schema::{ChannelConfig, LoggingConfig, PreemptionConfig},
    Error, Result,
};
use std::time::Duration;
use tracing::{debug, warn};
use validator::Validate;

/// Preemption waits above this make the protocol ineffective.
const LONG_PREEMPT_WAIT: Duration = Duration::from_secs(1);

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a configuration
    pub fn validate(config: &ChannelConfig) -> Result<()> {
        debug!("Starting configuration validation");

        config.validate().map_err(Error::from)?;
        Self::validate_preemption_config(&config.preemption)?;
        Self::validate_logging_config(&config.logging);

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_preemption_config(config: &PreemptionConfig) -> Result<()> {
        if config.max_preempt_time > config.preempt_wait {
            return Err(Error::Configuration(format!(
                "max_preempt_time ({:?}) must not exceed preempt_wait ({:?})",
                config.max_preempt_time, config.preempt_wait
            )));
        }

        if config.stop_preempt_threshold > config.preempt_wait {
            return Err(Error::Configuration(format!(
                "stop_preempt_threshold ({:?}) must not exceed preempt_wait ({:?})",
                config.stop_preempt_threshold, config.preempt_wait
            )));
        }

        if config.preempt_wait > LONG_PREEMPT_WAIT {
            warn!(
                "preempt_wait of {:?} lets low priority streams starve the preempting stream",
                config.preempt_wait
            );
        }

        Ok(())
    }

    fn validate_logging_config(config: &LoggingConfig) {
        if config.level.eq_ignore_ascii_case("trace") {
            warn!("Trace logging records every dispatched message");
        }
    }
}
