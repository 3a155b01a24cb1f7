use lapin::options::{BasicQosOptions, ConfirmSelectOptions};
use lapin::Channel;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::errors::{RabbitMQError, Result};

fn default_prefetch_count() -> u16 {
    10
}
fn default_confirm_mode() -> bool {
    true
}

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    #[serde(default = "default_confirm_mode")]
    pub confirm_mode: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: default_prefetch_count(),
            confirm_mode: default_confirm_mode(),
        }
    }
}

/// Applies QoS and confirm mode to a freshly opened channel.
pub(crate) async fn configure_channel(channel: &Channel, config: &ChannelConfig) -> Result<()> {
    if config.prefetch_count > 0 {
        debug!(channel_id = channel.id(), "Setting channel QoS to {}", config.prefetch_count);
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))?;
    }

    if config.confirm_mode {
        debug!(channel_id = channel.id(), "Enabling confirm mode");
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_config_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.prefetch_count, 10);
        assert!(config.confirm_mode);
    }

    #[test]
    fn test_channel_config_partial_json() {
        let config: ChannelConfig = serde_json::from_str(r#"{"prefetch_count": 50}"#).unwrap();
        assert_eq!(config.prefetch_count, 50);
        assert!(config.confirm_mode);
    }
}
