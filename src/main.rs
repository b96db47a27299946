//! Slice Download Server
//!
//! Loads configuration, sets up logging, wires the download service to its
//! collaborators and serves HTTP until Ctrl-C.

use anyhow::Context;
use slice_download::{
    server, DownloadConfig, DownloadService, HttpObjectStore, MemorySharedCache, RedisSharedCache,
    SharedCacheHandle, SqliteFileRepository,
};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Main entry point for the download server
///
/// # Usage
/// ```bash
/// # Start with default config (slice_download.yaml)
/// slice-download
///
/// # Start with custom config
/// slice-download /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    if let Err(e) = run().await {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    info!("Starting Slice Download Server");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "slice_download.yaml".to_string());
    info!("Loading configuration from: {}", config_path);

    let config = DownloadConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    info!("Configuration loaded successfully");
    info!("  - Listen address: {}", config.listen_address);
    info!("  - Cache dir: {}", config.cache_dir.display());
    info!("  - Origin: {} (bucket {})", config.origin.endpoint, config.origin.bucket);
    info!("  - Workers: {}", config.effective_pool_size());
    info!("  - Max attempts: {}", config.retry.max_attempts);
    info!(
        "  - Stream-direct threshold: {} MB",
        config.stream_direct_threshold / 1024 / 1024
    );

    let shutdown = CancellationToken::new();

    let store = Arc::new(HttpObjectStore::new(&config.origin)?);
    let repository = Arc::new(
        SqliteFileRepository::connect(&config.metadata.database_url)
            .await
            .context("opening metadata store")?,
    );
    let shared: SharedCacheHandle = match &config.redis {
        Some(redis) => {
            info!("Shared cache tier: redis at {}", redis.url);
            Arc::new(RedisSharedCache::start(redis, shutdown.child_token())?)
        }
        None => {
            info!("Shared cache tier: in-process");
            Arc::new(MemorySharedCache::new())
        }
    };

    let listen_address = config.listen_address.clone();
    let service = Arc::new(DownloadService::new(config, store, repository, shared).await?);

    let listener = TcpListener::bind(&listen_address)
        .await
        .with_context(|| format!("binding {}", listen_address))?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        signal_token.cancel();
    });

    server::serve(listener, Arc::clone(&service), shutdown).await?;
    service.shutdown().await;
    info!("Server stopped");
    Ok(())
}
