//! Delta Proxy Server
//!
//! Loads configuration, sets up logging, and starts the HTTP proxy together
//! with the optional metrics endpoint. `SIGHUP` reloads the configuration.

use anyhow::Context;
use delta_proxy::{
    DeltaConfig, DeltaProxy, MemoryStore, MetricsEndpoint, ProxyServer, UpstreamMetrics,
};
use prometheus::Registry;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

/// Main entry point for the delta proxy
///
/// # Usage
/// ```bash
/// # Start with default config (delta_proxy.yaml)
/// delta-proxy
///
/// # Start with custom config
/// delta-proxy /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "delta_proxy.yaml".to_string());

    let config = DeltaConfig::from_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    let level: Level = config.log_level.parse().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting delta proxy");
    info!("Configuration loaded from: {}", config_path);
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Cache TTL: {} seconds", config.cache.ttl_secs);
    info!("  - Max concurrent fetches: {}", config.max_concurrent_fetches);
    info!("  - Max retries: {}", config.max_retries);
    info!("  - Request timeout: {} ms", config.request_timeout_ms);
    for (name, backend) in &config.backends {
        info!(
            "  - Backend '{}': provider={}, hosts={:?}, backfill_tolerance={}s",
            name, backend.provider, backend.hosts, backend.backfill_tolerance_secs
        );
    }

    let store = match config.cache.max_size_bytes {
        Some(max) => MemoryStore::with_max_size(max),
        None => MemoryStore::new(),
    };

    let registry = Registry::new();
    let upstream_metrics =
        UpstreamMetrics::with_registry(&registry).context("failed to register upstream metrics")?;
    let proxy = DeltaProxy::from_config(&config, Arc::new(store))
        .context("failed to build backends")?
        .with_upstream_metrics(upstream_metrics);

    if let Some(endpoint) = config.metrics_endpoint.as_ref().filter(|e| e.enabled) {
        let addr: SocketAddr = endpoint
            .address
            .parse()
            .with_context(|| format!("invalid metrics address {}", endpoint.address))?;
        let endpoint = MetricsEndpoint::new(proxy.metrics_arc(), registry.clone(), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint stopped: {}", e);
            }
        });
    }

    spawn_reload_handler(config_path, config.clone(), proxy.clone());

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.listen_address))?;
    ProxyServer::new(proxy, addr)
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("proxy server stopped: {}", e))
}

/// Reload configuration on SIGHUP and rebuild backends when they changed
#[cfg(unix)]
fn spawn_reload_handler(path: String, mut config: DeltaConfig, proxy: DeltaProxy) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Hot reload disabled, cannot listen for SIGHUP: {}", e);
                return;
            }
        };

        while hangups.recv().await.is_some() {
            info!("SIGHUP received, reloading {}", path);
            let changes = match config.reload_from_file(&path) {
                Ok(changes) => changes,
                Err(e) => {
                    error!("Configuration reload rejected: {}", e);
                    continue;
                }
            };

            for change in changes.summary() {
                info!("  - {}", change);
            }
            if changes.requires_restart() {
                warn!("Some changes only take effect after a restart");
            }
            if changes.requires_registry_rebuild() {
                if let Err(e) = proxy.reload(&config) {
                    error!("Failed to rebuild backends: {}", e);
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_handler(_path: String, _config: DeltaConfig, _proxy: DeltaProxy) {
    warn!("Hot reload is only supported on unix");
}
