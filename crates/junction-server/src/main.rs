//! # Junction node
//!
//! Hosts a message bus with its two in-process channels. Services and
//! clients in the same process reach the bus through the channel handles;
//! socket transports plug in behind the same `DuplexInputChannel` trait.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! junction
//!
//! # Run with environment variables
//! JUNCTION_BYTE_ORDER=little junction
//! ```

mod config;
mod metrics;

use anyhow::Result;
use junction_bus::MessageBus;
use junction_channel::LocalChannel;
use junction_protocol::EnvelopeCodec;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "junction=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;
    let byte_order = config.byte_order()?;

    info!(
        service_channel = %config.bus.service_channel,
        client_channel = %config.bus.client_channel,
        "Starting Junction node"
    );

    // Initialize metrics
    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    // Assemble and attach the bus
    let bus = MessageBus::with_codec(EnvelopeCodec::with_byte_order(byte_order));
    let service_channel = LocalChannel::new(config.bus.service_channel.clone());
    let client_channel = LocalChannel::new(config.bus.client_channel.clone());

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => metrics::record_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Metrics observer lagged behind bus events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    bus.attach(
        Arc::new(service_channel.clone()),
        Arc::new(client_channel.clone()),
    )
    .await?;

    info!("Junction node running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    bus.detach().await?;

    Ok(())
}
