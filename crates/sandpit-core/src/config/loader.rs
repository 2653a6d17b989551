//! Configuration loader for YAML files

use crate::config::types::SandpitConfig;
use crate::errors::ConfigError;
use std::path::Path;
use tokio::fs;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<SandpitConfig, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Read {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Self::from_str(&content)
    }

    /// Load configuration from a file if it exists, defaults otherwise.
    pub async fn from_optional_file<P: AsRef<Path>>(
        path: P,
    ) -> Result<SandpitConfig, ConfigError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            let config = SandpitConfig::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<SandpitConfig, ConfigError> {
        let config: SandpitConfig = if content.trim().is_empty() {
            SandpitConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }
}
