use std::sync::Arc;

use talkbridge_engine::{Relay, RelayConfig};
use talkbridge_gateway::TransportChannel;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "talkbridge_server=debug,talkbridge_engine=debug,talkbridge_gateway=info,talkbridge_store=info".into()
            }),
        )
        .init();

    let config = RelayConfig::from_env()?;
    info!("Message store: {}", config.db_path.display());
    info!("Collector: {}", config.ws_url);
    info!("State directory: {}", config.state_dir.display());

    let channel = Arc::new(TransportChannel::start(config.channel_config()).await);
    let relay = Relay::new(config, channel.clone());

    // Access problems are retried every poll cycle, so only report them here
    if let Err(e) = relay.store().check_access() {
        warn!("Message store not readable yet: {}", e);
    }

    let result = relay.run(shutdown_signal()).await;
    channel.close().await;

    if let Err(e) = &result {
        error!("Relay stopped: {}", e);
    }
    result?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
