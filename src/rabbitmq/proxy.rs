// src/rabbitmq/proxy.rs
// Owns the broker connection, keeps subscribers bound across reconnects and
// retries failed publishes.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::LapinConnector;
use super::broker::{
    BrokerChannel, BrokerConnection, Connector, PublishProperties, QueueOptions,
};
use super::channel_manager::ChannelConfig;
use super::endpoint::EndpointConfig;
use super::errors::{RabbitMQError, Result};
use super::subscriber::{Consumer, Subscriber};

pub const DEFAULT_PUBLISH_ATTEMPTS: u8 = 3;

/// Live connection resources. Built by a successful `connect()` and dropped
/// by `disconnect()`; never reused.
struct ConnectionState {
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    properties: PublishProperties,
    connected_at: DateTime<Utc>,
}

/// Connection manager for one queue.
///
/// `connect`, `disconnect`, `register_subscriber` and `create_consumer` run
/// one at a time under `transitions`, which also guards the subscriber
/// registry. `live` is only written while `transitions` is held, so publishes
/// can read the current channel without waiting for a reconnect in progress.
pub struct RabbitProxy {
    id: Uuid,
    endpoint: EndpointConfig,
    connector: Arc<dyn Connector>,
    transitions: Mutex<Vec<Subscriber>>,
    live: RwLock<Option<Arc<ConnectionState>>>,
}

impl RabbitProxy {
    pub fn new(endpoint: EndpointConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint,
            connector,
            transitions: Mutex::new(Vec::new()),
            live: RwLock::new(None),
        }
    }

    /// Proxy backed by a real RabbitMQ connection.
    pub fn with_lapin(endpoint: EndpointConfig, channel_config: ChannelConfig) -> Self {
        Self::new(endpoint, Arc::new(LapinConnector::new(channel_config)))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// True while a channel is held. Does not probe the network.
    pub fn is_connected(&self) -> bool {
        self.live_state().is_some()
    }

    pub fn connected_since(&self) -> Option<DateTime<Utc>> {
        self.live_state().map(|state| state.connected_at)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.transitions.lock().await.len()
    }

    /// Opens connection and channel, declares the queue and binds every
    /// registered subscriber. Returns `true` right away when already connected.
    pub async fn connect(&self) -> bool {
        let subscribers = self.transitions.lock().await;
        if self.is_connected() {
            return true;
        }

        match self.open(&subscribers).await {
            Ok(state) => {
                info!(
                    queue = %self.endpoint.queue(),
                    subscribers = subscribers.len(),
                    "Connected to RabbitMQ"
                );
                self.set_live(Some(Arc::new(state)));
                true
            }
            Err(e) => {
                error!(endpoint = %self.endpoint, "Failed to connect to RabbitMQ: {}", e);
                false
            }
        }
    }

    /// Unbinds every subscriber and closes channel and connection.
    pub async fn disconnect(&self) {
        let subscribers = self.transitions.lock().await;
        let Some(state) = self.set_live(None) else {
            return;
        };

        for subscriber in subscribers.iter() {
            subscriber.unbind();
        }

        if let Err(e) = state.channel.close().await {
            warn!("Failed to close channel: {}", e);
        }
        if let Err(e) = state.connection.close().await {
            warn!("Failed to close connection: {}", e);
        }
        info!(queue = %self.endpoint.queue(), "Disconnected from RabbitMQ");
    }

    /// Publishes `payload` to the configured exchange, routed by queue name.
    ///
    /// Every failed attempt is followed by a full `disconnect()` + `connect()`
    /// before the next one. Returns `false` once `max_attempts` attempts have
    /// failed or when `cancellation` fires; a reconnect that is already
    /// running is not interrupted.
    pub async fn publish(
        &self,
        payload: &[u8],
        cancellation: &CancellationToken,
        max_attempts: u8,
    ) -> bool {
        let mut failed: u8 = 0;

        loop {
            if failed == max_attempts {
                error!(
                    queue = %self.endpoint.queue(),
                    attempts = failed,
                    "Giving up publishing message"
                );
                return false;
            }

            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(RabbitMQError::Cancelled),
                result = self.try_publish(payload) => result,
            };

            match result {
                Ok(()) => {
                    debug!(queue = %self.endpoint.queue(), bytes = payload.len(), "Message published");
                    return true;
                }
                Err(e) if !e.is_transient() => {
                    info!(queue = %self.endpoint.queue(), "Publish abandoned: {}", e);
                    return false;
                }
                Err(e) => {
                    failed += 1;
                    warn!(
                        attempt = failed,
                        max_attempts, "Publish failed, reconnecting: {}", e
                    );
                    self.disconnect().await;
                    self.connect().await;
                }
            }
        }
    }

    /// `publish` with [`DEFAULT_PUBLISH_ATTEMPTS`] and no cancellation.
    pub async fn publish_default(&self, payload: &[u8]) -> bool {
        self.publish(payload, &CancellationToken::new(), DEFAULT_PUBLISH_ATTEMPTS)
            .await
    }

    /// Adds `subscriber` to the registry and binds it when connected.
    ///
    /// Registering the same subscriber twice is a no-op. A subscriber that
    /// belongs to another proxy is rejected with `InvalidArgument`.
    pub async fn register_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        let mut subscribers = self.transitions.lock().await;
        subscriber.associate(self.id)?;

        if subscribers.iter().any(|existing| existing == subscriber) {
            debug!("Subscriber already registered");
            return Ok(());
        }
        subscribers.push(subscriber.clone());

        if let Some(state) = self.live_state() {
            if let Err(e) = subscriber.bind_on(&state.channel, self.endpoint.queue()).await {
                warn!(
                    queue = %self.endpoint.queue(),
                    "Failed to bind subscriber, it will be bound on next connect: {}", e
                );
            }
        }
        Ok(())
    }

    /// Starts a consumer on the live channel.
    pub async fn create_consumer(&self, consumer_tag: &str) -> Result<Consumer> {
        let _guard = self.transitions.lock().await;
        let state = self.live_state().ok_or_else(|| {
            RabbitMQError::IllegalState("There isn't a connection to create a consumer".to_string())
        })?;

        Consumer::open(state.channel.clone(), self.endpoint.queue(), consumer_tag).await
    }

    async fn try_publish(&self, payload: &[u8]) -> Result<()> {
        let state = self
            .live_state()
            .ok_or_else(|| RabbitMQError::PublishError("no open channel".to_string()))?;

        state
            .channel
            .publish(
                self.endpoint.publish_exchange(),
                self.endpoint.queue(),
                state.properties,
                payload,
            )
            .await
    }

    async fn open(&self, subscribers: &[Subscriber]) -> Result<ConnectionState> {
        let connection = self.connector.connect(&self.endpoint).await?;

        match self.open_channel(connection.as_ref(), subscribers).await {
            Ok(channel) => Ok(ConnectionState {
                connection,
                channel,
                properties: PublishProperties::persistent(),
                connected_at: Utc::now(),
            }),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!("Failed to close half-open connection: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn open_channel(
        &self,
        connection: &dyn BrokerConnection,
        subscribers: &[Subscriber],
    ) -> Result<Arc<dyn BrokerChannel>> {
        let channel = connection.create_channel().await?;

        if let Err(e) = self.prepare_channel(&channel, subscribers).await {
            for subscriber in subscribers {
                subscriber.unbind();
            }
            if let Err(close_err) = channel.close().await {
                debug!("Failed to close half-open channel: {}", close_err);
            }
            return Err(e);
        }
        Ok(channel)
    }

    async fn prepare_channel(
        &self,
        channel: &Arc<dyn BrokerChannel>,
        subscribers: &[Subscriber],
    ) -> Result<()> {
        let queue = self.endpoint.queue();
        channel.declare_queue(queue, QueueOptions::durable()).await?;

        let bound = join_all(
            subscribers
                .iter()
                .map(|subscriber| subscriber.bind_on(channel, queue)),
        )
        .await;
        bound.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    fn live_state(&self) -> Option<Arc<ConnectionState>> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_live(&self, state: Option<Arc<ConnectionState>>) -> Option<Arc<ConnectionState>> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *live, state)
    }
}
