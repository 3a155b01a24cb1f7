// src/rabbitmq/subscriber.rs

use async_trait::async_trait;
use futures::StreamExt;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{BrokerChannel, DeliveryStream, MessageEnvelope};
use super::errors::{RabbitMQError, Result};
use super::proxy::RabbitProxy;

/// User code run for every delivered message.
///
/// Returning `Ok` acknowledges the delivery. Returning `Err` leaves the
/// outcome to the subscriber's [`FailurePolicy`].
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(MessageEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: MessageEnvelope) -> anyhow::Result<()> {
        (self)(envelope).await
    }
}

/// What happens to a delivery whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// No ack and no nack; the broker redelivers once the channel closes.
    #[default]
    Leave,
    /// `basic.nack` with `requeue = true`.
    Requeue,
    /// `basic.nack` with `requeue = false` (dead-letters if the queue has a DLX).
    Discard,
}

#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    pub failure_policy: FailurePolicy,
    pub consumer_tag_prefix: String,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Leave,
            consumer_tag_prefix: "consumer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Unbound,
    Bound,
}

/// A consumer freshly started on a channel, not yet attached to a subscriber.
pub struct Consumer {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
    deliveries: DeliveryStream,
}

impl Consumer {
    pub(crate) async fn open(
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Self> {
        let deliveries = channel.consume(queue, consumer_tag).await?;
        info!(queue = %queue, consumer_tag = %consumer_tag, "Started consuming");

        Ok(Self {
            channel,
            consumer_tag: consumer_tag.to_string(),
            deliveries,
        })
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

struct ActiveBinding {
    consumer_tag: String,
    task: JoinHandle<()>,
}

struct SubscriberInner {
    handler: Arc<dyn MessageHandler>,
    options: SubscriberOptions,
    proxy_id: Mutex<Option<Uuid>>,
    binding: Mutex<Option<ActiveBinding>>,
}

impl Drop for SubscriberInner {
    fn drop(&mut self) {
        let binding = self.binding.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(binding) = binding.take() {
            binding.task.abort();
        }
    }
}

/// A handler plus its (re)bindable consumer.
///
/// Clones share identity: two `Subscriber`s are equal only when they are
/// clones of the same original.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn new(handler: impl MessageHandler) -> Self {
        Self::with_options(handler, SubscriberOptions::default())
    }

    pub fn with_options(handler: impl MessageHandler, options: SubscriberOptions) -> Self {
        Self {
            inner: Arc::new(SubscriberInner {
                handler: Arc::new(handler),
                options,
                proxy_id: Mutex::new(None),
                binding: Mutex::new(None),
            }),
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.inner.options.failure_policy
    }

    pub fn state(&self) -> SubscriberState {
        if self.binding().is_some() {
            SubscriberState::Bound
        } else {
            SubscriberState::Unbound
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state() == SubscriberState::Bound
    }

    /// Tag of the consumer this subscriber is currently attached to.
    pub fn consumer_tag(&self) -> Option<String> {
        self.binding().as_ref().map(|b| b.consumer_tag.clone())
    }

    /// Id of the proxy this subscriber is registered with.
    pub fn proxy_id(&self) -> Option<Uuid> {
        *self.inner.proxy_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (Re)binds to the proxy's current channel.
    pub async fn bind(&self, proxy: &RabbitProxy) -> Result<()> {
        self.check_association(proxy.id())?;
        self.unbind();

        let consumer = proxy.create_consumer(&self.next_consumer_tag()).await?;
        self.attach(consumer);
        Ok(())
    }

    /// Stops handling deliveries from the current consumer. No-op when unbound.
    pub fn unbind(&self) {
        if let Some(binding) = self.binding().take() {
            binding.task.abort();
            debug!(consumer_tag = %binding.consumer_tag, "Subscriber unbound");
        }
    }

    pub(crate) async fn bind_on(&self, channel: &Arc<dyn BrokerChannel>, queue: &str) -> Result<()> {
        self.unbind();

        let consumer = Consumer::open(channel.clone(), queue, &self.next_consumer_tag()).await?;
        self.attach(consumer);
        Ok(())
    }

    /// Records the proxy this subscriber belongs to.
    pub(crate) fn associate(&self, proxy_id: Uuid) -> Result<()> {
        let mut current = self.inner.proxy_id.lock().unwrap_or_else(PoisonError::into_inner);
        match *current {
            Some(existing) if existing != proxy_id => Err(RabbitMQError::InvalidArgument(format!(
                "subscriber is already registered with proxy {}",
                existing
            ))),
            _ => {
                *current = Some(proxy_id);
                Ok(())
            }
        }
    }

    fn check_association(&self, proxy_id: Uuid) -> Result<()> {
        match self.proxy_id() {
            Some(existing) if existing != proxy_id => Err(RabbitMQError::InvalidArgument(format!(
                "subscriber is registered with proxy {}",
                existing
            ))),
            _ => Ok(()),
        }
    }

    fn attach(&self, consumer: Consumer) {
        let Consumer {
            channel,
            consumer_tag,
            deliveries,
        } = consumer;

        let task = tokio::spawn(run_deliveries(
            self.inner.handler.clone(),
            self.inner.options.failure_policy,
            channel,
            consumer_tag.clone(),
            deliveries,
        ));

        let mut binding = self.binding();
        if let Some(previous) = binding.replace(ActiveBinding { consumer_tag, task }) {
            previous.task.abort();
        }
    }

    fn next_consumer_tag(&self) -> String {
        format!("{}-{}", self.inner.options.consumer_tag_prefix, Uuid::new_v4())
    }

    fn binding(&self) -> MutexGuard<'_, Option<ActiveBinding>> {
        self.inner.binding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subscriber {}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("state", &self.state())
            .field("consumer_tag", &self.consumer_tag())
            .field("failure_policy", &self.failure_policy())
            .finish()
    }
}

async fn run_deliveries(
    handler: Arc<dyn MessageHandler>,
    failure_policy: FailurePolicy,
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
    mut deliveries: DeliveryStream,
) {
    while let Some(delivery) = deliveries.next().await {
        let envelope = match delivery {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(consumer_tag = %consumer_tag, "Error receiving message: {}", e);
                break;
            }
        };
        let delivery_tag = envelope.delivery_tag;

        match handler.handle(envelope).await {
            Ok(()) => {
                if let Err(e) = channel.ack(delivery_tag).await {
                    error!(consumer_tag = %consumer_tag, delivery_tag, "Failed to acknowledge message: {}", e);
                }
            }
            Err(e) => {
                warn!(
                    consumer_tag = %consumer_tag,
                    delivery_tag,
                    policy = ?failure_policy,
                    "Error processing message: {:#}",
                    e
                );
                let requeue = match failure_policy {
                    FailurePolicy::Leave => continue,
                    FailurePolicy::Requeue => true,
                    FailurePolicy::Discard => false,
                };
                if let Err(e) = channel.nack(delivery_tag, requeue).await {
                    error!(consumer_tag = %consumer_tag, delivery_tag, "Failed to negatively acknowledge message: {}", e);
                }
            }
        }
    }

    debug!(consumer_tag = %consumer_tag, "Delivery stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::memory::{Acknowledgement, MemoryBroker};
    use crate::rabbitmq::{BrokerConnection, Connector, EndpointConfig};
    use std::time::Duration;

    fn endpoint() -> EndpointConfig {
        EndpointConfig::new("localhost", 5672, "guest", "guest", "jobs")
    }

    async fn open_channel(broker: &MemoryBroker) -> (Box<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = broker.connect(&endpoint()).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        (connection, channel)
    }

    async fn wait_for_acks(broker: &MemoryBroker, count: usize) -> Vec<Acknowledgement> {
        for _ in 0..200 {
            let acks = broker.acknowledgements();
            if acks.len() >= count {
                return acks;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broker.acknowledgements()
    }

    #[tokio::test]
    async fn test_clones_share_identity() {
        let a = Subscriber::new(|_: MessageEnvelope| async { anyhow::Ok(()) });
        let b = Subscriber::new(|_: MessageEnvelope| async { anyhow::Ok(()) });

        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_unbind_when_unbound_is_noop() {
        let subscriber = Subscriber::new(|_: MessageEnvelope| async { anyhow::Ok(()) });
        subscriber.unbind();
        assert_eq!(subscriber.state(), SubscriberState::Unbound);
        assert!(subscriber.consumer_tag().is_none());
    }

    #[tokio::test]
    async fn test_rebind_replaces_consumer() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        let subscriber = Subscriber::new(|_: MessageEnvelope| async { anyhow::Ok(()) });

        subscriber.bind_on(&channel, "jobs").await.unwrap();
        let first = subscriber.consumer_tag().unwrap();
        subscriber.bind_on(&channel, "jobs").await.unwrap();
        let second = subscriber.consumer_tag().unwrap();

        assert!(subscriber.is_bound());
        assert_ne!(first, second);
        assert!(second.starts_with("consumer-"));
    }

    #[tokio::test]
    async fn test_successful_handler_acks_single_tag() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        let subscriber = Subscriber::new(|_: MessageEnvelope| async { anyhow::Ok(()) });
        subscriber.bind_on(&channel, "jobs").await.unwrap();

        let tag = broker.deliver("jobs", b"payload".to_vec()).unwrap();
        let acks = wait_for_acks(&broker, 1).await;

        assert_eq!(
            acks,
            vec![Acknowledgement::Ack {
                delivery_tag: tag,
                multiple: false
            }]
        );
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_message_by_default() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
        let subscriber = Subscriber::new(move |envelope: MessageEnvelope| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send(envelope.delivery_tag).ok();
                Err::<(), _>(anyhow::anyhow!("cannot process"))
            }
        });
        subscriber.bind_on(&channel, "jobs").await.unwrap();

        let tag = broker.deliver("jobs", b"bad".to_vec()).unwrap();
        assert_eq!(seen_rx.recv().await, Some(tag));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(broker.acknowledgements().is_empty());
    }

    #[tokio::test]
    async fn test_failure_policies_nack() {
        for (policy, requeue) in [(FailurePolicy::Requeue, true), (FailurePolicy::Discard, false)] {
            let broker = MemoryBroker::new();
            let (_connection, channel) = open_channel(&broker).await;
            let subscriber = Subscriber::with_options(
                |_: MessageEnvelope| async { Err::<(), _>(anyhow::anyhow!("boom")) },
                SubscriberOptions {
                    failure_policy: policy,
                    ..SubscriberOptions::default()
                },
            );
            subscriber.bind_on(&channel, "jobs").await.unwrap();

            let tag = broker.deliver("jobs", b"x".to_vec()).unwrap();
            let acks = wait_for_acks(&broker, 1).await;

            assert_eq!(acks, vec![Acknowledgement::Nack { delivery_tag: tag, requeue }]);
        }
    }

    #[tokio::test]
    async fn test_deliveries_processed_in_order() {
        let broker = MemoryBroker::new();
        let (_connection, channel) = open_channel(&broker).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let subscriber = Subscriber::new(move |envelope: MessageEnvelope| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(envelope.payload);
                anyhow::Ok(())
            }
        });
        subscriber.bind_on(&channel, "jobs").await.unwrap();

        for i in 0..5u8 {
            broker.deliver("jobs", vec![i]).unwrap();
        }
        let acks = wait_for_acks(&broker, 5).await;

        assert_eq!(*seen.lock().unwrap(), vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
        let tags: Vec<u64> = acks
            .iter()
            .map(|a| match a {
                Acknowledgement::Ack { delivery_tag, .. } => *delivery_tag,
                Acknowledgement::Nack { delivery_tag, .. } => *delivery_tag,
            })
            .collect();
        assert_eq!(tags, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_associate_rejects_second_proxy() {
        let subscriber = Subscriber::new(|_: MessageEnvelope| async { anyhow::Ok(()) });
        let first = Uuid::new_v4();

        subscriber.associate(first).unwrap();
        subscriber.associate(first).unwrap();
        let err = subscriber.associate(Uuid::new_v4()).unwrap_err();

        assert!(matches!(err, RabbitMQError::InvalidArgument(_)));
        assert_eq!(subscriber.proxy_id(), Some(first));
    }
}
