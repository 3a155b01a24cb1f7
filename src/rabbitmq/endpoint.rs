use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_vhost() -> String {
    "/".to_string()
}
fn default_heartbeat() -> u16 {
    30
}
fn default_timeout() -> u64 {
    5000
}

/// Connection parameters for one queue on one broker.
///
/// Nothing is validated here: a wrong host or bad credentials show up as a
/// failed `connect()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    host: String,
    port: u16,
    username: String,
    password: String,
    queue: String,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default = "default_vhost")]
    vhost: String,
    #[serde(default = "default_heartbeat")]
    heartbeat_seconds: u16,
    #[serde(default = "default_timeout")]
    connection_timeout_ms: u64,
}

impl EndpointConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            queue: queue.into(),
            exchange: None,
            vhost: default_vhost(),
            heartbeat_seconds: default_heartbeat(),
            connection_timeout_ms: default_timeout(),
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn with_heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat_seconds = seconds;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    /// Exchange to publish to; the default exchange when none is configured.
    pub fn publish_exchange(&self) -> &str {
        self.exchange.as_deref().unwrap_or("")
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    pub fn heartbeat_seconds(&self) -> u16 {
        self.heartbeat_seconds
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_seconds),
                connection_timeout: Some(self.connection_timeout_ms),
                ..AMQPQueryString::default()
            },
            ..AMQPUri::default()
        }
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "amqp://{}:***@{}:{}/{} queue={} exchange={}",
            self.username,
            self.host,
            self.port,
            self.vhost.trim_start_matches('/'),
            self.queue,
            self.exchange.as_deref().unwrap_or("(default)")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_accessors() {
        let endpoint = EndpointConfig::new("rabbit.local", 5673, "svc", "s3cret", "orders");

        assert_eq!(endpoint.host(), "rabbit.local");
        assert_eq!(endpoint.port(), 5673);
        assert_eq!(endpoint.queue(), "orders");
        assert_eq!(endpoint.exchange(), None);
        assert_eq!(endpoint.publish_exchange(), "");
        assert_eq!(endpoint.vhost(), "/");
        assert_eq!(endpoint.heartbeat_seconds(), 30);
        assert_eq!(endpoint.connection_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_display_masks_password() {
        let endpoint = EndpointConfig::new("localhost", 5672, "guest", "hunter2", "orders")
            .with_exchange("events");
        let shown = endpoint.to_string();

        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("guest:***@localhost:5672"));
        assert!(shown.contains("exchange=events"));
    }

    #[test]
    fn test_amqp_uri_carries_credentials() {
        let endpoint = EndpointConfig::new("broker", 5672, "user_rust", "p@ss/word", "jobs")
            .with_vhost("vhost_rust")
            .with_heartbeat(10);
        let uri = endpoint.amqp_uri();

        assert_eq!(uri.authority.host, "broker");
        assert_eq!(uri.authority.userinfo.username, "user_rust");
        assert_eq!(uri.authority.userinfo.password, "p@ss/word");
        assert_eq!(uri.vhost, "vhost_rust");
        assert_eq!(uri.query.heartbeat, Some(10));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let endpoint: EndpointConfig = serde_json::from_str(
            r#"{"host":"h","port":5672,"username":"u","password":"p","queue":"q"}"#,
        )
        .unwrap();

        assert_eq!(endpoint.vhost(), "/");
        assert_eq!(endpoint.exchange(), None);
        assert_eq!(endpoint.heartbeat_seconds(), 30);
    }
}
