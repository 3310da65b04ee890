//! Configuration schema definitions for gpuchan
//!
//! All structures derive serde for (de)serialization and validator for field
//! checks. Durations are written to TOML as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Default age after which a pending message on the preempting stream
/// triggers preemption (two frames at 60Hz).
pub const DEFAULT_PREEMPT_WAIT: Duration = Duration::from_millis(34);

/// Default budget a preemption may hold the flag for (one frame).
pub const DEFAULT_MAX_PREEMPT_TIME: Duration = Duration::from_millis(17);

/// Default head age below which an active preemption stops (one frame).
pub const DEFAULT_STOP_PREEMPT_THRESHOLD: Duration = Duration::from_millis(17);

/// Levels accepted by [`LoggingConfig::level`].
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Root configuration of one channel.
///
/// Loaded in layers: defaults, then a TOML file, then `GPUCHAN_` environment
/// variables. See [`crate::config::ConfigLoader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct ChannelConfig {
    /// Timing of the preemption protocol
    #[validate(nested)]
    pub preemption: PreemptionConfig,

    /// Stream creation policy
    #[validate(nested)]
    pub streams: StreamConfig,

    /// Tracing output
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Timing constants of the preemption state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PreemptionConfig {
    /// How old the head of the preempting stream must be before preemption starts
    #[serde(with = "duration_ms")]
    #[validate(custom(function = "validate_positive_duration"))]
    pub preempt_wait: Duration,

    /// Maximum total time the preempting flag stays set for one preemption
    #[serde(with = "duration_ms")]
    #[validate(custom(function = "validate_positive_duration"))]
    pub max_preempt_time: Duration,

    /// Preemption ends once the head is younger than this
    #[serde(with = "duration_ms")]
    #[validate(custom(function = "validate_positive_duration"))]
    pub stop_preempt_threshold: Duration,
}

impl Default for PreemptionConfig {
    fn default() -> Self {
        Self {
            preempt_wait: DEFAULT_PREEMPT_WAIT,
            max_preempt_time: DEFAULT_MAX_PREEMPT_TIME,
            stop_preempt_threshold: DEFAULT_STOP_PREEMPT_THRESHOLD,
        }
    }
}

/// Policy applied when clients create streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct StreamConfig {
    /// Accept `StreamPriority::RealTime` in stream creation requests
    pub allow_real_time_streams: bool,
}

/// Tracing subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Text }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable single line output
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

fn validate_positive_duration(value: &Duration) -> Result<(), ValidationError> {
    if value.is_zero() {
        return Err(ValidationError::new("duration_must_be_positive"));
    }
    Ok(())
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_log_level"))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
