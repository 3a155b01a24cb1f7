// Requires a running RabbitMQ; configure it with RABBITMQ_* variables or .env.
// Run with `cargo test -- --ignored`.

use rust_rabbit_proxy::{ChannelConfig, EndpointConfig, MessageEnvelope, RabbitProxy, Subscriber};
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
async fn test_round_trip_through_broker() {
    let endpoint = EndpointConfig::from_env().expect("RABBITMQ_QUEUE must be set");
    let proxy = RabbitProxy::with_lapin(endpoint, ChannelConfig::default());

    let (received_tx, mut received_rx) = mpsc::unbounded_channel();
    let subscriber = Subscriber::new(move |envelope: MessageEnvelope| {
        let received_tx = received_tx.clone();
        async move {
            received_tx.send(envelope.payload)?;
            anyhow::Ok(())
        }
    });
    proxy.register_subscriber(&subscriber).await.unwrap();

    assert!(proxy.connect().await);
    assert!(subscriber.is_bound());
    assert!(proxy.publish_default(b"live-round-trip").await);

    let payload = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match received_rx.recv().await {
                Some(payload) if payload == b"live-round-trip" => return payload,
                Some(_) => continue,
                None => panic!("subscriber dropped"),
            }
        }
    })
    .await
    .expect("message was not delivered in time");
    assert_eq!(payload, b"live-round-trip".to_vec());

    proxy.disconnect().await;
    assert!(!proxy.is_connected());
    assert!(!subscriber.is_bound());
}

#[tokio::test]
#[ignore]
async fn test_unreachable_host_returns_false() {
    let endpoint = EndpointConfig::new("127.0.0.1", 1, "guest", "guest", "unreachable")
        .with_connection_timeout(Duration::from_millis(500));
    let proxy = RabbitProxy::with_lapin(endpoint, ChannelConfig::default());

    assert!(!proxy.connect().await);
    assert!(!proxy.is_connected());
}
