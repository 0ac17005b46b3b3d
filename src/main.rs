use imagecache::{
    cache::{MemoryStore, ObjectStore, SledStore},
    config::{CacheBackend, ProxyConfig},
    fetch::HttpOrigin,
    router,
    writeback::TrackedScheduler,
    AppState,
};
use std::{net::SocketAddr, sync::Arc};

/// Image cache proxy entry point.
///
/// Initializes tracing, loads and validates configuration, then serves every
/// request through the caching proxy until Ctrl-C or SIGTERM. Pending cache
/// writes are allowed to finish before the process exits.
///
/// # Configuration
/// Environment variables:
/// - `UPSTREAM_ORIGIN`: https origin images are fetched from (required)
/// - `ALLOWED_PATH_PREFIXES`, `CACHE_PREFIX`, `CACHE_BACKEND`, `CACHE_DIR`,
///   `MAX_CACHE_OBJECT_SIZE`, `PORT`: see [`ProxyConfig::from_env`]
/// - `RUST_LOG`: Logging verbosity (default: "imagecache=debug,tower_http=debug")
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imagecache=debug,tower_http=debug".into()),
        )
        .init();

    tracing::info!("Starting image cache proxy");

    let cfg = ProxyConfig::from_env()?;
    cfg.validate()?;
    tracing::info!(
        upstream = %cfg.upstream_origin,
        prefixes = ?cfg.allowed_path_prefixes,
        backend = %cfg.cache_backend,
        "Configuration loaded"
    );

    let store = open_store(&cfg)?;
    let origin = Arc::new(HttpOrigin::new(cfg.upstream_origin.clone())?);
    let scheduler = TrackedScheduler::new();
    let port = cfg.port;

    let state = AppState::new(cfg, store, origin, Arc::new(scheduler.clone()));
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Server listening on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(pending = scheduler.pending(), "Waiting for pending cache writes");
    scheduler.drain().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn open_store(cfg: &ProxyConfig) -> Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error>> {
    match cfg.cache_backend {
        CacheBackend::Sled => {
            let store = SledStore::new(&cfg.cache_dir)?;
            let stats = store.stats();
            tracing::info!(
                dir = ?cfg.cache_dir,
                entries = stats.entry_count,
                size_bytes = stats.total_size_bytes,
                "Opened sled cache"
            );
            Ok(Arc::new(store))
        }
        CacheBackend::Memory => {
            tracing::warn!("Using in-memory cache, entries are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
