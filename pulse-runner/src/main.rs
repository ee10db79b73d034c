use anyhow::Result;
use pulse_core::Config;
use pulse_core::PulseContext;
use pulse_gateway::{run as run_gateway, RoomRegistry};
use pulse_services::media::MAX_VIDEO_BYTES;
use std::sync::Arc;
use tokio;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting Pulse chat gateway");

    // Load configuration
    let config = Config::from_env();
    let ctx = PulseContext::new(config).await?;

    tracing::info!("Pulse context initialized");

    // The media bucket is created lazily on first boot; a blob-store outage
    // here must not keep the gateway from serving chat.
    if let Err(e) = ctx.storage.ensure_bucket(MAX_VIDEO_BYTES).await {
        tracing::warn!("Could not verify media bucket: {}", e);
    }

    let rooms = Arc::new(RoomRegistry::new());

    // Bus consumer runs for the lifetime of the instance
    let consumer_ctx = ctx.clone();
    let consumer_rooms = rooms.clone();
    tokio::spawn(async move {
        if let Err(e) = pulse_gateway::consumer::run(consumer_ctx, consumer_rooms).await {
            tracing::error!("Bus consumer error: {}", e);
        }
    });

    // Gateway runs in the main task
    tracing::info!("Starting gateway server");
    run_gateway(ctx, rooms).await?;

    Ok(())
}
