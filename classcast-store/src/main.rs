//! classcast-store - coordination store daemon
//!
//! Shares TTL hashes, sets, lists and pub/sub channels between gateway
//! processes in a multi-process deployment.

use classcast_store::{MemoryStore, StoreDaemonConfig, StoreServer};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = StoreDaemonConfig::from_env();
    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load peer secrets: {}", e);
        return Err(e.into());
    }

    tracing::info!("Starting classcast coordination store");
    tracing::info!("  Bind address: {}", config.bind_addr);
    tracing::info!("  Max peers: {}", config.max_connections);
    match config.idle_timeout() {
        Some(timeout) => tracing::info!("  Idle timeout: {:?}", timeout),
        None => tracing::info!("  Idle timeout: disabled"),
    }
    if config.peer_secret_digests.is_empty() {
        tracing::warn!("  Peer authentication: disabled");
    } else {
        tracing::info!(
            "  Peer authentication: enabled ({} secret(s))",
            config.peer_secret_digests.len()
        );
    }

    let store = Arc::new(MemoryStore::with_channel_capacity(config.channel_capacity));
    let server = Arc::new(StoreServer::new(config, store));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping store...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    tracing::info!("Coordination store stopped");
    Ok(())
}
