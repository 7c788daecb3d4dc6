use super::Config;
use crate::errors::ConfigError;
use anyhow::Result;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

pub struct ConfigManager {
    current_config: Arc<Config>,
}

impl ConfigManager {
    pub async fn new(config_dir: String) -> Result<Self> {
        let config = Self::load_configuration(&config_dir).await?;
        Ok(Self {
            current_config: Arc::new(config),
        })
    }

    pub fn get_current_config(&self) -> Arc<Config> {
        self.current_config.clone()
    }

    async fn load_configuration(config_dir: &str) -> Result<Config> {
        let main_config_path = format!("{}/main.toml", config_dir);
        let main_config_content = fs::read_to_string(&main_config_path)
            .await
            .map_err(|e| ConfigError::LoadFailed {
                path: main_config_path.clone(),
                reason: e.to_string(),
            })?;

        let config = Self::parse(&main_config_content)?;

        info!(
            "Loaded config: snapshots {}, statesync {} ({} trusted providers), replicator {}",
            if config.snapshots.enabled { "enabled" } else { "disabled" },
            if config.statesync.enabled { "enabled" } else { "disabled" },
            config.statesync.trusted_providers.len(),
            if config.replicator.enabled { "enabled" } else { "disabled" },
        );

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}
