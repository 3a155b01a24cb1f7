// src/rabbitmq/broker.rs
// Capability set the proxy needs from a broker client library.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

use super::endpoint::EndpointConfig;
use super::errors::Result;

/// One delivered message: the broker's delivery tag and the raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
}

impl MessageEnvelope {
    pub fn new(delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            payload: payload.into(),
        }
    }
}

/// Properties attached to every outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub persistent: bool,
}

impl PublishProperties {
    pub fn persistent() -> Self {
        Self { persistent: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Survives broker restarts, shared between connections, never deleted
    /// by the broker on its own.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

pub type DeliveryStream = BoxStream<'static, Result<MessageEnvelope>>;

/// Opens connections against an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: &[u8],
    ) -> Result<()>;

    /// Starts a consumer with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    /// Acknowledges exactly one delivery (`multiple = false`).
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
