// src/rabbitmq/errors.rs

use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Broker-level failures a reconnect may cure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_)
                | RabbitMQError::ChannelError(_)
                | RabbitMQError::PublishError(_)
                | RabbitMQError::ConsumeError(_)
                | RabbitMQError::AckError(_)
                | RabbitMQError::TimeoutError(_)
        )
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<std::env::VarError> for RabbitMQError {
    fn from(err: std::env::VarError) -> Self {
        RabbitMQError::Config(format!("Environment variable error: {}", err))
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::Config(format!("Parse error: {}", err))
    }
}
