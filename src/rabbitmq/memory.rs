//! In-process broker implementing the broker traits.
//!
//! Used by the test suite and for running the service without RabbitMQ.
//! Every interaction is recorded so callers can assert on handshakes,
//! declarations, publishes and acknowledgements. Failures can be injected
//! per operation with the `fail_*` methods.
//!
//! Delivery is explicit: [`MemoryBroker::deliver`] hands a payload to one of
//! the consumers of a queue (round-robin). Published messages are recorded
//! but never routed to consumers.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::broker::{
    BrokerChannel, BrokerConnection, Connector, DeliveryStream, MessageEnvelope,
    PublishProperties, QueueOptions,
};
use super::endpoint::EndpointConfig;
use super::errors::{RabbitMQError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub name: String,
    pub options: QueueOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack { delivery_tag: u64, multiple: bool },
    Nack { delivery_tag: u64, requeue: bool },
}

struct ActiveConsumer {
    tag: String,
    queue: String,
    channel_id: u64,
    sender: mpsc::UnboundedSender<Result<MessageEnvelope>>,
    next_delivery_tag: Arc<AtomicU64>,
}

#[derive(Default)]
struct BrokerState {
    connects: usize,
    connections_closed: usize,
    channels_opened: usize,
    channels_closed: usize,
    publish_attempts: usize,
    declared: Vec<DeclaredQueue>,
    published: Vec<PublishedMessage>,
    acknowledgements: Vec<Acknowledgement>,
    consumers: Vec<ActiveConsumer>,
    fail_connects: usize,
    fail_channels: usize,
    fail_declares: usize,
    fail_publishes: usize,
    fail_consumes: usize,
    next_channel_id: u64,
    next_consumer: usize,
}

/// Shared handle to an in-memory broker; clones observe the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` connection attempts fail.
    pub fn fail_connects(&self, count: usize) {
        self.state().fail_connects = count;
    }

    pub fn fail_channels(&self, count: usize) {
        self.state().fail_channels = count;
    }

    pub fn fail_declares(&self, count: usize) {
        self.state().fail_declares = count;
    }

    /// The next `count` publishes fail; `usize::MAX` fails all of them.
    pub fn fail_publishes(&self, count: usize) {
        self.state().fail_publishes = count;
    }

    pub fn fail_consumes(&self, count: usize) {
        self.state().fail_consumes = count;
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn connections_closed(&self) -> usize {
        self.state().connections_closed
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    pub fn channels_closed(&self) -> usize {
        self.state().channels_closed
    }

    pub fn publish_attempts(&self) -> usize {
        self.state().publish_attempts
    }

    pub fn declared(&self) -> Vec<DeclaredQueue> {
        self.state().declared.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn acknowledgements(&self) -> Vec<Acknowledgement> {
        self.state().acknowledgements.clone()
    }

    /// Number of consumers currently attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && !c.sender.is_closed())
            .count()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && !c.sender.is_closed())
            .map(|c| c.tag.clone())
            .collect()
    }

    /// Hands `payload` to the next live consumer of `queue` and returns the
    /// delivery tag it was given, or `None` when nobody consumes the queue.
    pub fn deliver(&self, queue: &str, payload: impl Into<Vec<u8>>) -> Option<u64> {
        let mut state = self.state();
        state.consumers.retain(|c| !c.sender.is_closed());

        let candidates: Vec<usize> = state
            .consumers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.queue == queue)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let index = candidates[state.next_consumer % candidates.len()];
        state.next_consumer = state.next_consumer.wrapping_add(1);

        let consumer = &state.consumers[index];
        let delivery_tag = consumer.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
        consumer
            .sender
            .unbounded_send(Ok(MessageEnvelope::new(delivery_tag, payload)))
            .ok()?;
        Some(delivery_tag)
    }

    fn take_failure(counter: &mut usize) -> bool {
        if *counter == 0 {
            return false;
        }
        if *counter != usize::MAX {
            *counter -= 1;
        }
        true
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Box<dyn BrokerConnection>> {
        let mut state = self.state();
        state.connects += 1;
        if Self::take_failure(&mut state.fail_connects) {
            return Err(RabbitMQError::ConnectionError(format!(
                "connection refused by {}:{}",
                endpoint.host(),
                endpoint.port()
            )));
        }

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionError("connection closed".into()));
        }

        let mut state = self.broker.state();
        if MemoryBroker::take_failure(&mut state.fail_channels) {
            return Err(RabbitMQError::ChannelError("channel open refused".into()));
        }
        state.channels_opened += 1;
        state.next_channel_id += 1;

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id: state.next_channel_id,
            closed: AtomicBool::new(false),
            next_delivery_tag: Arc::new(AtomicU64::new(0)),
        }))
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.state().connections_closed += 1;
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    closed: AtomicBool,
    next_delivery_tag: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError(format!(
                "channel {} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if MemoryBroker::take_failure(&mut state.fail_declares) {
            return Err(RabbitMQError::ChannelError(format!(
                "PRECONDITION_FAILED declaring {}",
                queue
            )));
        }
        state.declared.push(DeclaredQueue {
            name: queue.to_string(),
            options,
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: PublishProperties,
        body: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.publish_attempts += 1;
        if MemoryBroker::take_failure(&mut state.fail_publishes) {
            return Err(RabbitMQError::PublishError("channel write failed".into()));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body: body.to_vec(),
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if MemoryBroker::take_failure(&mut state.fail_consumes) {
            return Err(RabbitMQError::ConsumeError(format!(
                "NOT_FOUND no queue '{}'",
                queue
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        state.consumers.push(ActiveConsumer {
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            channel_id: self.id,
            sender,
            next_delivery_tag: self.next_delivery_tag.clone(),
        });

        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .state()
            .acknowledgements
            .push(Acknowledgement::Ack {
                delivery_tag,
                multiple: false,
            });
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .state()
            .acknowledgements
            .push(Acknowledgement::Nack {
                delivery_tag,
                requeue,
            });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.broker.state();
        state.channels_closed += 1;
        state.consumers.retain(|c| c.channel_id != self.id);
        Ok(())
    }
}
