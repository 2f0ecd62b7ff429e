use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::{GatewayConfig, StorageBackend};
use turnstile::gate::{Gate, HttpServer};
use turnstile::mesh::Cluster;
use turnstile::ratelimit::{ClusterCounterStore, CounterStore, MemoryCounterStore, RateLimiter};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Rate limiting gate for an HTTP API gateway.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
    }

    info!("Starting Turnstile rate limiting gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::load(args.config.as_deref())?;
    let routes = Arc::new(config.route_table()?);
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.storage.backend,
        routes = routes.len(),
        "Configuration loaded"
    );

    // Initialize counter storage
    let mut cluster = None;
    let store: Arc<dyn CounterStore> = match config.storage.backend {
        StorageBackend::Memory => {
            Arc::new(MemoryCounterStore::new(config.storage.local_cache_size))
        }
        StorageBackend::Cluster => {
            let node = Arc::new(Cluster::start(config.storage.cluster.to_cluster_config()).await?);
            info!(live_nodes = node.live_node_count().await, "Joined cluster");
            cluster = Some(node.clone());
            Arc::new(ClusterCounterStore::new(node))
        }
    };

    let rate_limiter = Arc::new(RateLimiter::with_settings(
        store,
        config.storage.lock_shards,
        config.storage.storage_timeout(),
    ));
    info!("Rate limiter initialized");

    let gate = Gate::new(rate_limiter, routes);
    let server = HttpServer::new(config.server.http_addr, gate);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still in use, skipping graceful leave"),
        }
    }

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
