pub mod discovery_config;
pub mod logging_config;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub use discovery_config::{DiscoveryConfig, MovementServiceConfig};
pub use logging_config::LoggingConfig;

use crate::utils::ensure_directory_exists;

const CONFIG_DIR_NAME: &str = "ecg-bridge";
const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

/// Location of the config file under the user's config directory.
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("No config directory on this system")?;
    Ok(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

impl AppConfig {
    /// Loads the config from `path`, falling back to defaults if the file does not exist.
    pub async fn load_config(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Config file not found at {:?}, using default.", path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&config_json)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        config.discovery.validate()?;

        info!("Config loaded from {:?}", path);
        Ok(config)
    }

    /// Saves the config to `path`, creating its directory if needed.
    pub async fn save_config(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            ensure_directory_exists(parent).await?;
        }

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(path, config_json).await?;
        info!("Config saved to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::load_config(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let mut config = AppConfig::default();
        config.discovery.scan_timeout_secs = 4;
        config.logging.level = "debug".into();

        config.save_config(&path).await.unwrap();
        let loaded = AppConfig::load_config(&path).await.unwrap();

        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, r#"{"discovery": {"scan_timeout_secs": 0}}"#)
            .await
            .unwrap();

        assert!(AppConfig::load_config(&path).await.is_err());
    }

    #[test]
    fn default_path_ends_with_the_app_directory() {
        if let Ok(path) = default_config_path() {
            assert!(path.ends_with("ecg-bridge/config.json"));
        }
    }
}
