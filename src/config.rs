//! Configuration management for video-tracking.
//!
//! Handles loading named connection strings from a TOML file, with an
//! environment variable override for the default entry.

use crate::error::{Result, TrackerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Name of the connection string used when none is given explicitly.
pub const DEFAULT_CONNECTION_NAME: &str = "ConnString";

/// Environment variable that overrides the default connection string.
pub const CONNECTION_STRING_ENV: &str = "VIDEO_TRACKING_CONNSTRING";

/// Environment variable pointing at an alternative config file.
pub const CONFIG_PATH_ENV: &str = "VIDEO_TRACKING_CONFIG";

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Named connection strings.
    #[serde(default)]
    pub connection_strings: HashMap<String, String>,
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("video-tracking")
            .join("config.toml")
    }

    /// Returns the config path from `VIDEO_TRACKING_CONFIG`, or the default path.
    pub fn resolve_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path)
    }

    /// Loads the process-wide configuration.
    pub fn load() -> Result<Self> {
        Self::load_from_file(&Self::resolve_path())
    }

    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            TrackerError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Resolves a named connection string.
    ///
    /// For the default name, `VIDEO_TRACKING_CONNSTRING` takes precedence over
    /// the file.
    pub fn connection_string(&self, name: &str) -> Result<String> {
        if name == DEFAULT_CONNECTION_NAME {
            if let Some(value) = std::env::var(CONNECTION_STRING_ENV)
                .ok()
                .filter(|v| !v.trim().is_empty())
            {
                return Ok(value);
            }
        }

        self.connection_strings
            .get(name)
            .cloned()
            .ok_or_else(|| {
                TrackerError::config(format!(
                    "Connection string '{name}' is not configured. Set {CONNECTION_STRING_ENV} \
                     or add it under [connection_strings] in {}",
                    Self::resolve_path().display()
                ))
            })
    }
}
