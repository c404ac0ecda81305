use std::{fs, io, path::Path};

use libstereo::stereo::DiscoveryConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File looked up in the host's working directory
pub const CONFIG_FILE: &str = "stereo-plugin.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `off`, `error`, `warn`, `info`, `debug` or `trace`
    pub level: String,
    pub directory: String,
    /// Log files kept after cleanup, newest first
    pub keep_files: usize,
    /// Open a console window for stdout output
    pub console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            directory: "logs".to_string(),
            keep_files: 10,
            console: false,
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Debug)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub log: LogConfig,
    pub discovery: DiscoveryConfig,
}

impl PluginConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Defaults when the file is missing; defaults plus the error when it is
    /// unreadable or malformed. The logger is not up yet, so the caller
    /// reports the error.
    pub fn load_or_default(path: impl AsRef<Path>) -> (Self, Option<ConfigError>) {
        match Self::load(path) {
            Ok(config) => (config, None),
            Err(ConfigError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                (Self::default(), None)
            }
            Err(err) => (Self::default(), Some(err)),
        }
    }
}
