//! Configuration management

use anyhow::{Context, Result};
use chatrelay_broadcaster::ListenerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Relay listener settings
    pub listener: ListenerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            listener: ListenerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default location, or create it
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_config_path())
    }

    /// Load configuration from `path`, writing defaults there if it is missing
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config_path = path.as_ref().to_path_buf();

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;

            let mut config: DaemonConfig = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;

            config.config_path = config_path;
            Ok(config)
        } else {
            let config = Self {
                config_path,
                ..Self::default()
            };
            config.save().context("Failed to save default config")?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatrelay")
            .join("config.toml")
    }
}
