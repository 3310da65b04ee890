//! # Configuration Loading
//!
//! Layers defaults, an optional TOML file and `GPUCHAN_` environment
//! variables into a validated [`ChannelConfig`].

use crate::{
    config::{schema::ChannelConfig, validator::ConfigValidator},
    Error, Result,
};
use std::{
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// File names probed in every search path, in order.
const CONFIG_FILE_NAMES: [&str; 2] = ["gpuchan.toml", "config.toml"];

/// Separator between nesting levels in environment variable names.
const ENV_NESTING_SEPARATOR: &str = "__";

/// Layered loader for [`ChannelConfig`].
///
/// Precedence, lowest first: built-in defaults, the first config file found in
/// the search paths, then prefixed environment variables.
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Loader probing `.`, `./config` and the user config directory.
    pub fn new() -> Self {
        Self {
            search_paths: vec![
                PathBuf::from("."),
                PathBuf::from("./config"),
                dirs::config_dir().map_or_else(|| PathBuf::from("/etc"), |dir| dir.join("gpuchan")),
            ],
            env_prefix: "GPUCHAN".to_string(),
        }
    }

    /// Probe `path` after the current search paths.
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Probe only `path`.
    pub fn only_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths = vec![path.as_ref().to_path_buf()];
        self
    }

    /// Read overrides from `<prefix>_*` variables instead of `GPUCHAN_*`.
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Load and validate using the process environment.
    ///
    /// # Errors
    /// Fails on unreadable or malformed files and on invalid results.
    pub fn load(&self) -> Result<ChannelConfig> {
        self.load_with_env(env::vars())
    }

    /// Load and validate using `vars` as the environment.
    ///
    /// # Errors
    /// Same as [`load`](Self::load).
    pub fn load_with_env<I>(&self, vars: I) -> Result<ChannelConfig>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config_value = toml::Value::try_from(ChannelConfig::default())
            .map_err(|e| Error::Configuration(format!("Cannot encode default channel config: {e}")))?;
        debug!(paths = self.search_paths.len(), "Resolving channel configuration");

        if let Some(config_path) = self.find_config_file() {
            let file_config = Self::load_config_file(&config_path)?;
            config_value = Self::merge_config(config_value, file_config);
            info!(path = %config_path.display(), "Merged channel config file");
        } else {
            debug!("No channel config file, using defaults");
        }

        let overrides = self.collect_env_vars(vars);
        debug!("Collected {} environment overrides", overrides.len());
        for (key, value) in overrides {
            let parts: Vec<&str> = key.split('.').collect();
            Self::set_nested_value(&mut config_value, &parts, &value);
        }

        let config: ChannelConfig = config_value
            .try_into()
            .map_err(|e| Error::Configuration(format!("Invalid channel config: {e}")))?;

        ConfigValidator::validate(&config)?;
        info!(
            preempt_wait_ms = config.preemption.preempt_wait.as_millis() as u64,
            max_preempt_time_ms = config.preemption.max_preempt_time.as_millis() as u64,
            "Channel configuration ready"
        );
        Ok(config)
    }

    /// Load one file, filling missing sections with defaults. Ignores the
    /// environment.
    ///
    /// # Errors
    /// [`Error::Io`] if the file cannot be read, a configuration error otherwise.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<ChannelConfig> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Reading channel config file");

        let content = std::fs::read_to_string(path)?;
        let config: ChannelConfig = toml::from_str(&content)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Write `config` as TOML, durations in milliseconds.
    ///
    /// # Errors
    /// Fails if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, config: &ChannelConfig, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| Error::Configuration(format!("Cannot encode channel config: {e}")))?;
        std::fs::write(path.as_ref(), toml_string)?;
        info!(path = %path.as_ref().display(), "Channel config written");
        Ok(())
    }

    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    #[must_use]
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
            .find(|path| path.is_file())
    }

    fn load_config_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {e}", path.display()))
        })?;

        content.parse::<toml::Value>().map_err(|e| {
            Error::Configuration(format!("Malformed TOML in {}: {e}", path.display()))
        })
    }

    /// Overlay `layer` onto `base`. Tables merge key by key, anything else replaces.
    fn merge_config(base: toml::Value, layer: toml::Value) -> toml::Value {
        match (base, layer) {
            (toml::Value::Table(mut merged), toml::Value::Table(layer)) => {
                for (key, value) in layer {
                    let value = match merged.remove(&key) {
                        Some(existing) => Self::merge_config(existing, value),
                        None => value,
                    };
                    merged.insert(key, value);
                }
                toml::Value::Table(merged)
            },
            (_, layer) => layer,
        }
    }

    /// Map `PREFIX_SECTION__FIELD_NAME` to `section.field_name`
    fn collect_env_vars<I>(&self, vars: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = format!("{}_", self.env_prefix);
        let mut overrides: Vec<(String, String)> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let stripped = key.strip_prefix(&prefix)?;
                if stripped.is_empty() {
                    return None;
                }
                let path = stripped.to_lowercase().split(ENV_NESTING_SEPARATOR).collect::<Vec<_>>().join(".");
                Some((path, value))
            })
            .collect();
        overrides.sort();
        overrides
    }

    fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: &str) {
        let Some((first, rest)) = parts.split_first() else {
            return;
        };
        let toml::Value::Table(table) = config else {
            return;
        };

        if rest.is_empty() {
            table.insert((*first).to_string(), Self::parse_env_value(value));
            return;
        }

        let entry = table
            .entry((*first).to_string())
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
        Self::set_nested_value(entry, rest, value);
    }

    /// Environment values are untyped; take the narrowest TOML type that parses.
    fn parse_env_value(raw: &str) -> toml::Value {
        raw.parse::<bool>()
            .map(toml::Value::Boolean)
            .or_else(|_| raw.parse::<i64>().map(toml::Value::Integer))
            .or_else(|_| raw.parse::<f64>().map(toml::Value::Float))
            .unwrap_or_else(|_| toml::Value::String(raw.to_string()))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
