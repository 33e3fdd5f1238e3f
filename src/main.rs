use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{ServiceConfig, StorageBackend};
use gatekeeper::http::{Admission, HttpServer};
use gatekeeper::ratelimit::{IdentityResolver, RateLimiter};
use gatekeeper::storage::{shutdown, MemoryStore, RedisOptions, RedisStore, Storage};

/// HTTP admission control with fixed-window rate limiting.
#[derive(Parser, Debug)]
#[command(name = "gatekeeper", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        max_requests = config.rate_limiting.max_requests,
        block_duration = ?config.rate_limiting.block_duration,
        token_overrides = config.rate_limiting.token_limits.len(),
        "Configuration loaded"
    );

    let storage = open_storage(&config).await?;
    info!(backend = storage.name(), "Storage initialized");

    let served = serve(&config, Arc::clone(&storage)).await;

    // Close the store on every exit path, then report how serving ended.
    if let Err(e) = shutdown(storage.as_ref()).await {
        error!(error = %e, "Failed to close storage");
    }
    served?;

    info!("Gatekeeper stopped");
    Ok(())
}

async fn open_storage(config: &ServiceConfig) -> anyhow::Result<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.storage.backend {
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
        StorageBackend::Redis => {
            let url = config.storage.redis_url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("storage.redis_url is required for the redis backend")
            })?;
            let options = RedisOptions {
                key_prefix: config.storage.key_prefix.clone(),
                connect_timeout: config.storage.connect_timeout,
                operation_timeout: config.storage.operation_timeout,
            };
            Arc::new(RedisStore::connect(url, options).await?)
        }
    };
    Ok(storage)
}

async fn serve(config: &ServiceConfig, storage: Arc<dyn Storage>) -> anyhow::Result<()> {
    let limits = config.rate_limiting.to_limit_config();
    let resolver = IdentityResolver::new(&limits.identity_header)?;
    let limiter = Arc::new(RateLimiter::new(storage, limits));

    let admission = Arc::new(
        Admission::new(limiter, resolver).with_rate_limit_headers(config.server.rate_limit_headers),
    );

    let app = Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .route(
            "/health",
            get(|| async { Json(serde_json::json!({ "status": "healthy" })) }),
        );

    HttpServer::new(config.server.http_addr, app, admission)
        .serve_with_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
