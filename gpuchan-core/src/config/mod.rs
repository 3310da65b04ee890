//! Configuration management for gpuchan
//!
//! Configuration is schema driven and loaded in layers: built-in defaults, a
//! TOML file found in the search paths, then `GPUCHAN_` environment variables
//! where `__` separates nesting levels.
//!
//! ```rust,no_run
//! use gpuchan_core::config::ConfigLoader;
//!
//! // GPUCHAN_PREEMPTION__PREEMPT_WAIT=50 overrides preemption.preempt_wait
//! let config = ConfigLoader::new().load().expect("Failed to load configuration");
//! println!("preempt wait: {:?}", config.preemption.preempt_wait);
//! ```

pub mod loader;
pub mod schema;
pub mod validator;

pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::ConfigValidator;

use crate::Result;
use std::path::Path;

/// Load configuration from the default search paths and the process environment.
pub fn load_default() -> Result<ChannelConfig> {
    ConfigLoader::new().load()
}

/// Load configuration from a specific file.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ChannelConfig> {
    ConfigLoader::new().load_from_file(path)
}

/// Validate a configuration object.
pub fn validate(config: &ChannelConfig) -> Result<()> {
    ConfigValidator::validate(config)
}
