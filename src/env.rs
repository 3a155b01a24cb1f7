use dotenv::dotenv;
use std::env;
use std::time::Duration;

use crate::rabbitmq::{EndpointConfig, RabbitMQError, Result};

fn default_port() -> u16 {
    5672
}

fn default_heartbeat_seconds() -> u16 {
    30
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl EndpointConfig {
    /// Reads the endpoint from `RABBITMQ_*` variables, after loading `.env`.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`EndpointConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let queue = lookup("RABBITMQ_QUEUE")
            .filter(|q| !q.is_empty())
            .ok_or_else(|| RabbitMQError::Config("RABBITMQ_QUEUE must be set".to_string()))?;

        let port = match lookup("RABBITMQ_PORT") {
            Some(val) => val.parse()?,
            None => default_port(),
        };
        let heartbeat = match lookup("RABBITMQ_HEARTBEAT_SECONDS") {
            Some(val) => val.parse()?,
            None => default_heartbeat_seconds(),
        };
        let timeout_ms = match lookup("RABBITMQ_CONNECT_TIMEOUT_MS") {
            Some(val) => val.parse()?,
            None => default_connect_timeout_ms(),
        };

        let mut endpoint = EndpointConfig::new(
            lookup("RABBITMQ_HOST").unwrap_or_else(|| "localhost".to_string()),
            port,
            lookup("RABBITMQ_USER").unwrap_or_else(|| "guest".to_string()),
            lookup("RABBITMQ_PASSWORD").unwrap_or_else(|| "guest".to_string()),
            queue,
        )
        .with_heartbeat(heartbeat)
        .with_connection_timeout(Duration::from_millis(timeout_ms));

        if let Some(vhost) = lookup("RABBITMQ_VHOST") {
            endpoint = endpoint.with_vhost(vhost);
        }
        if let Some(exchange) = lookup("RABBITMQ_EXCHANGE").filter(|e| !e.is_empty()) {
            endpoint = endpoint.with_exchange(exchange);
        }
        Ok(endpoint)
    }
}
