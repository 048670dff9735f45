//! Discovery Proxy binary

use anyhow::Context;
use discovery::{MemoryStore, ServiceBroker};
use discovery_proxy::{Config, ProxyServer, setup_tracing_with_otel};
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);

    // Load configuration first (needed for telemetry settings)
    let config = match Config::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) if config_path.is_some() => {
            return Err(e).context("failed to load configuration");
        }
        Err(e) => {
            // Can't use tracing yet - not initialized
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    let _telemetry_guard = setup_tracing_with_otel(&config.telemetry, &config.logging)?;

    tracing::info!("Discovery proxy starting");

    let broker = Arc::new(ServiceBroker::new(
        config.to_discovery_config(),
        Arc::new(MemoryStore::new()),
    ));

    if !config.static_instances.is_empty() {
        let ids = broker.registry().await.register_all(&config.static_instances).await;
        let registered = ids.iter().filter(|id| id.is_some()).count();
        tracing::info!(
            registered,
            configured = config.static_instances.len(),
            "Registered static instances"
        );
        tracing::debug!("{}", broker.dump_instances().await);
    }

    let server = ProxyServer::new(config.to_proxy_config(), broker.clone());
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    server.run().await.context("proxy server failed")?;

    broker.close().await;
    tracing::info!("Discovery proxy stopped");

    // Telemetry guard will flush spans on drop

    Ok(())
}
