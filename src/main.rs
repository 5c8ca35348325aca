//! Group Cache - persistent group-membership caches for a directory service
//!
//! HTTP front end over the cache registry: membership queries, change
//! event ingestion and cache administration.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use group_cache::api::create_router;
use group_cache::{spawn_flush_task, AppState, CacheRegistry, Config};

/// Main entry point for the group cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Open the storage backend and the configured caches
/// 4. Start the writer and the index flush task
/// 5. Serve HTTP until SIGINT/SIGTERM
/// 6. Persist the membership index and flush storage
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "group_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Group Cache Server");

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        "Configuration loaded: backend={}, data_dir={}, shards={:?}, port={}",
        config.backend,
        config.data_dir.display(),
        config.shard_classes,
        config.server_port
    );

    let registry = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || CacheRegistry::init(&config))
            .await
            .context("registry initialization panicked")?
            .context("failed to open caches")?
    };
    let registry = Arc::new(registry);

    let (state, writer_handle) = AppState::start(Arc::clone(&registry), config.event_queue_depth);
    let flush_handle = spawn_flush_task(Arc::clone(&registry), config.index_flush_interval);
    info!("Background tasks started");

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(flush_handle))
        .await
        .context("server error")?;

    // The router held the last writer handles; wait for queued jobs to drain
    if let Err(e) = writer_handle.await {
        error!(error = %e, "writer task panicked");
    }

    match tokio::task::spawn_blocking(move || registry.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "shutdown did not complete cleanly"),
        Err(e) => error!(error = %e, "shutdown task panicked"),
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the flush task; the final flush happens in
/// `main` after the server has stopped.
async fn shutdown_signal(flush_handle: tokio::task::JoinHandle<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    flush_handle.abort();
    warn!("Index flush task aborted");
}
