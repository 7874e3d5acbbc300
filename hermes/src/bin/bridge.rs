use clap::Parser;
use hermes::{Bridge, BridgeConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BridgeConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let bridge = Bridge::start(&config).await.map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        "bridging {} [{}] to ws://{}",
        bridge.endpoint(),
        config.topics().join(", "),
        bridge.local_addr()
    );

    // Keep the bridge alive until Ctrl+C; dropping it aborts the background tasks
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
