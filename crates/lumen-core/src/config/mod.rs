//! Configuration management for Lumen.
//!
//! Configuration is loaded from `config.toml` in the platform config directory
//! with sensible defaults. Every section implements `Default`, so a partial
//! file only overrides what it names.

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for Lumen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Message broker settings
    pub broker: BrokerConfig,

    /// Worker pool and retry settings
    pub worker: WorkerConfig,

    /// Object storage settings
    pub storage: StorageConfig,

    /// Image operation defaults and limits
    pub processing: ProcessingConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.lumen.lumen/config.toml
    /// - Linux: ~/.config/lumen/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\lumen\config\config.toml
    ///
    /// Falls back to ~/.lumen/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "lumen", "lumen")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let expanded = shellexpand::tilde("~/.lumen/config.toml");
                PathBuf::from(expanded.into_owned())
            })
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}
