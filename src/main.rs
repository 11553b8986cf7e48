//! classcast - real-time gateway
//!
//! Accepts client connections, binds them to feature namespaces and relays
//! room broadcasts across gateway processes.

use classcast_server::config::{Config, StoreMode};
use classcast_server::fanout::{FanoutTransport, LocalFanout, StoreFanout};
use classcast_server::metrics::run_metrics_server;
use classcast_server::{
    standard_namespaces, AccessDirectory, Authenticator, Broadcaster, ConnectionHandler,
    ConnectionRegistry, MemoryDirectory, Metrics, NamespaceManager, Server, Services,
};
use classcast_store::{CoordinationStore, MemoryStore, RemoteStore, RemoteStoreConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Interval of the in-process store's expiry sweep.
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::var("CLASSCAST_CONFIG").ok();
    let mut config = match Config::load() {
        Ok(c) => {
            if let Some(ref path) = config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.load_secrets() {
        tracing::error!("Failed to load auth secrets: {}", e);
        return Err(e.into());
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    let instance_id = config
        .deployment
        .instance_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    tracing::info!("Starting classcast gateway {}", instance_id);
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Deployment: {:?}", config.deployment.mode);
    tracing::info!(
        "  Heartbeat: every {}s, timeout {}s",
        config.heartbeat.interval_secs,
        config.heartbeat.timeout_secs
    );

    // Coordination store
    let (store, fanout): (Arc<dyn CoordinationStore>, Arc<dyn FanoutTransport>) =
        match config.store.mode {
            StoreMode::Memory => {
                tracing::info!("  Coordination store: in-process");
                let memory = Arc::new(MemoryStore::new());
                memory.spawn_sweeper(MEMORY_SWEEP_INTERVAL);
                let store: Arc<dyn CoordinationStore> = memory;
                let fanout: Arc<dyn FanoutTransport> = Arc::new(LocalFanout::default());
                (store, fanout)
            }
            StoreMode::Remote => {
                let addr = config.store.endpoint_addr()?;
                let mut remote = RemoteStoreConfig::new(addr)
                    .with_client_name(format!("gateway-{}", instance_id))
                    .with_call_timeout(config.store.call_timeout());
                if let Some(ref token) = config.store.token {
                    remote = remote.with_token(token);
                }
                let store: Arc<dyn CoordinationStore> = match RemoteStore::connect(remote).await
                {
                    Ok(store) => Arc::new(store),
                    Err(e) => {
                        tracing::error!("Coordination store {} unreachable: {}", addr, e);
                        return Err(e.into());
                    }
                };
                tracing::info!("  Coordination store: {}", addr);
                let fanout: Arc<dyn FanoutTransport> = Arc::new(StoreFanout::new(
                    store.clone(),
                    config.deployment.fanout_channel.clone(),
                ));
                (store, fanout)
            }
        };

    // Access directory
    let directory: Arc<dyn AccessDirectory> = match config.directory.fixture_path {
        Some(ref path) => {
            let directory = MemoryDirectory::from_fixture(path)?;
            tracing::info!(
                "  Access directory: {} ({} resources)",
                path.display(),
                directory.len()
            );
            Arc::new(directory)
        }
        None => {
            tracing::warn!("  Access directory: empty, only user and organizational rooms resolve");
            Arc::new(MemoryDirectory::new())
        }
    };

    let metrics = Arc::new(Metrics::new()?);
    let broadcaster = Arc::new(Broadcaster::new(
        instance_id,
        Arc::new(ConnectionRegistry::new()),
        fanout,
        metrics.clone(),
    ));
    let services = Services::new(store, directory, broadcaster.clone(), config.ttl.clone());

    let manager = Arc::new(NamespaceManager::new(broadcaster, config.deployment.mode));
    for namespace in standard_namespaces(&services) {
        manager.register(namespace);
    }
    if let Err(e) = manager.start().await {
        tracing::error!("Failed to start fan-out: {}", e);
        return Err(e.into());
    }

    let authenticator = Authenticator::from_config(&config.auth)?;
    let handler = Arc::new(ConnectionHandler::new(
        manager.clone(),
        authenticator,
        config.rate_limits.clone(),
        config.heartbeat.clone(),
    ));
    let server = Arc::new(Server::new(config.network.clone(), handler));

    let metrics_handle = if config.metrics.enabled {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        }))
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server_handle = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => {
                    tracing::error!("Gateway stopped: {}", e);
                    return Err(e.into());
                }
                Ok(Ok(())) => tracing::info!("Gateway stopped"),
                Err(e) => tracing::error!("Gateway task failed: {}", e),
            }
        }
    }

    server.shutdown();
    manager.stop();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
