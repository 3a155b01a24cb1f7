// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::rabbitmq::{ChannelConfig, EndpointConfig, DEFAULT_PUBLISH_ATTEMPTS};

pub const CONFIG_FILE_NAME: &str = "RustRabbitProxy.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub publish: PublishSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_max_attempts() -> u8 {
    DEFAULT_PUBLISH_ATTEMPTS
}

pub fn find_config_file() -> Result<PathBuf> {
    let local = Path::new(CONFIG_FILE_NAME).to_path_buf();
    let nested = Path::new("config").join(CONFIG_FILE_NAME);

    for (location_name, path) in [("Current directory", local), ("config directory", nested)] {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path);
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<ProxyConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(path: &Path) -> Result<ProxyConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: ProxyConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &ProxyConfig) -> Result<()> {
    if config.endpoint.host().is_empty() {
        return Err(anyhow!("Configuration error: endpoint.host cannot be empty"));
    }
    if config.endpoint.queue().is_empty() {
        return Err(anyhow!("Configuration error: endpoint.queue cannot be empty"));
    }
    Ok(())
}

pub fn default_config() -> ProxyConfig {
    ProxyConfig {
        endpoint: EndpointConfig::new("localhost", 5672, "guest", "guest", "rust_proxy_queue"),
        channel: ChannelConfig::default(),
        publish: PublishSettings::default(),
    }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&default_config())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
