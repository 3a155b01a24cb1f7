// src/rabbitmq/amqp_client.rs
// lapin-backed implementation of the broker traits.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, info};

use super::broker::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, MessageEnvelope,
    PublishProperties, QueueOptions,
};
use super::channel_manager::{configure_channel, ChannelConfig};
use super::endpoint::EndpointConfig;
use super::errors::{RabbitMQError, Result};

const REPLY_SUCCESS: u16 = 200;

/// Connects to a real broker with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    channel_config: ChannelConfig,
}

impl LapinConnector {
    pub fn new(channel_config: ChannelConfig) -> Self {
        Self { channel_config }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn BrokerConnection>> {
        info!("Attempting to connect to RabbitMQ at {}", endpoint);

        let connection = tokio::time::timeout(
            endpoint.connection_timeout(),
            Connection::connect_uri(endpoint.amqp_uri(), ConnectionProperties::default()),
        )
        .await?
        .map_err(|e| RabbitMQError::ConnectionError(format!("Failed to connect: {}", e)))?;

        Ok(Box::new(LapinConnection {
            connection,
            channel_config: self.channel_config.clone(),
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    channel_config: ChannelConfig,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

        configure_channel(&channel, &self.channel_config).await?;

        info!(channel_id = channel.id(), "Channel created and configured successfully");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Closing connection")
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to declare queue: {}", e)))?;

        debug!(
            queue = %queue,
            messages = declared.message_count(),
            consumers = declared.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: &[u8],
    ) -> Result<()> {
        let mut amqp_properties = BasicProperties::default();
        if properties.persistent {
            amqp_properties = amqp_properties.with_delivery_mode(2);
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                body,
                amqp_properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(RabbitMQError::PublishError(
                "Broker rejected the message".to_string(),
            ));
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| MessageEnvelope::new(d.delivery_tag, d.data))
                    .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Closing channel")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}
