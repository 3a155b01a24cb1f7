// src/rabbitmq/mod.rs
// RabbitMQ connection proxy and subscription management

// RabbitMQ-specific errors
pub mod errors;
pub mod broker;
pub mod endpoint;
pub mod memory;
pub mod proxy;
pub mod subscriber;

// lapin implementation details
mod amqp_client;
mod channel_manager;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinConnector;
pub use broker::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, MessageEnvelope,
    PublishProperties, QueueOptions,
};
pub use channel_manager::ChannelConfig;
pub use endpoint::EndpointConfig;
pub use errors::{RabbitMQError, Result};
pub use memory::MemoryBroker;
pub use proxy::{RabbitProxy, DEFAULT_PUBLISH_ATTEMPTS};
pub use subscriber::{
    Consumer, FailurePolicy, MessageHandler, Subscriber, SubscriberOptions, SubscriberState,
};
