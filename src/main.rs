use anyhow::{Context, Result};
use rust_rabbit_proxy::config::{self, ProxyConfig, PublishSettings, CONFIG_FILE_NAME};
use rust_rabbit_proxy::{ChannelConfig, EndpointConfig, MessageEnvelope, RabbitProxy, Subscriber};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        if command == "init-config" {
            let path = args
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
            return config::create_default_config_file(&path);
        }
        anyhow::bail!("Unknown command '{}'. Usage: rust-rabbit-proxy [init-config [path]]", command);
    }

    let settings = load_settings()?;
    info!("Using endpoint {}", settings.endpoint);

    let proxy = RabbitProxy::with_lapin(settings.endpoint.clone(), settings.channel.clone());

    let subscriber = Subscriber::new(|envelope: MessageEnvelope| async move {
        info!(
            delivery_tag = envelope.delivery_tag,
            "Received: {}",
            String::from_utf8_lossy(&envelope.payload)
        );
        anyhow::Ok(())
    });
    proxy.register_subscriber(&subscriber).await?;

    if !proxy.connect().await {
        warn!("Initial connection failed; publishing will retry");
    }

    let shutdown = CancellationToken::new();
    let startup = format!("rust-rabbit-proxy started at {}", chrono::Utc::now().to_rfc3339());
    if proxy
        .publish(startup.as_bytes(), &shutdown, settings.publish.max_attempts)
        .await
    {
        info!("Published startup message");
    } else {
        warn!("Could not publish startup message");
    }

    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    shutdown.cancel();

    info!("Closing connection...");
    proxy.disconnect().await;
    Ok(())
}

/// Config file when one exists, otherwise `RABBITMQ_*` environment variables.
fn load_settings() -> Result<ProxyConfig> {
    match config::find_config_file() {
        Ok(path) => config::load_config_from(&path),
        Err(_) => {
            let endpoint = EndpointConfig::from_env()
                .context("No config file found and environment is incomplete")?;
            Ok(ProxyConfig {
                endpoint,
                channel: ChannelConfig::default(),
                publish: PublishSettings::default(),
            })
        }
    }
}
