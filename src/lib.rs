//! Single-connection RabbitMQ proxy.
//!
//! [`RabbitProxy`] owns one connection and channel to a broker, publishes
//! opaque byte payloads with bounded retry (reconnecting between attempts)
//! and keeps registered [`Subscriber`]s bound to the live channel across
//! reconnects.
//!
//! ```no_run
//! use rust_rabbit_proxy::{ChannelConfig, EndpointConfig, MessageEnvelope, RabbitProxy, Subscriber};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let endpoint = EndpointConfig::new("localhost", 5672, "guest", "guest", "orders");
//! let proxy = RabbitProxy::with_lapin(endpoint, ChannelConfig::default());
//!
//! let subscriber = Subscriber::new(|envelope: MessageEnvelope| async move {
//!     println!("received {} bytes", envelope.payload.len());
//!     anyhow::Ok(())
//! });
//! proxy.register_subscriber(&subscriber).await?;
//!
//! proxy.connect().await;
//! let published = proxy.publish_default(b"abc").await;
//! # let _ = published;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use rabbitmq::{
    ChannelConfig, EndpointConfig, FailurePolicy, MessageEnvelope, MessageHandler, RabbitMQError,
    RabbitProxy, Subscriber, SubscriberOptions, DEFAULT_PUBLISH_ATTEMPTS,
};
