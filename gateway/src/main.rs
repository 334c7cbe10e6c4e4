//! CivicLedger settlement node.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use civicledger_common::ChannelSink;
use civicledger_gateway::{LedgerService, ServiceConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting CivicLedger settlement node");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    // Notification dispatch is external; events are logged until it attaches.
    let (sink, mut events) = ChannelSink::new();
    let dispatcher = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(payload) => debug!(event = event.name(), %payload, "Event published"),
                Err(e) => warn!(event = event.name(), error = %e, "Event not serializable"),
            }
        }
    });

    let service = Arc::new(LedgerService::new(config, Arc::new(sink))?);
    service.start().await?;

    info!(
        node_id = %service.node_id(),
        base_currency = %service.config().base_currency,
        "Settlement node running"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    service.stop().await?;
    match serde_json::to_string(&service.metrics().snapshot()) {
        Ok(counters) => info!(%counters, "Final counters"),
        Err(e) => warn!(error = %e, "Counters not serializable"),
    }

    // The engines hold the last senders; dropping the service closes the channel.
    drop(service);
    if let Err(e) = dispatcher.await {
        error!(error = %e, "Event dispatcher ended abnormally");
    }

    info!("Settlement node shutdown complete");
    Ok(())
}
