//! Peer registry daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;

use peerchat::api::{self, AppState};
use peerchat::liveness::ProtocolChecker;
use peerchat::{AddressRegistry, Config, EvictionScheduler, TransportConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting peer registry with config: {:?}", cfg);

    // Registry, restored from the snapshot when one is configured
    let registry = Arc::new(match &cfg.state_file {
        Some(path) => AddressRegistry::load(path, cfg.eviction_threshold).await?,
        None => AddressRegistry::with_threshold(cfg.eviction_threshold),
    });

    // Eviction sweep
    let checker = Arc::new(ProtocolChecker::new(&TransportConfig::for_probes(&cfg)));
    let mut scheduler =
        EvictionScheduler::new(Arc::clone(&registry), checker, cfg.sweep_period());
    if let Some(path) = cfg.state_file.clone() {
        let registry = Arc::clone(&registry);
        scheduler = scheduler.on_sweep(move |_report| {
            let registry = Arc::clone(&registry);
            let path = path.clone();
            async move {
                if let Err(e) = registry.save(&path).await {
                    error!("Failed to save registry snapshot: {}", e);
                }
            }
        });
    }
    let sweep = scheduler.spawn();

    // REST API
    let app = api::create_router(AppState::new(Arc::clone(&registry)));
    let listener = tokio::net::TcpListener::bind(cfg.api_bind).await?;
    info!("Registry API listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Graceful Shutdown
    sweep.stop(cfg.shutdown_grace()).await;
    if let Some(path) = &cfg.state_file {
        registry.save(path).await?;
    }

    info!("Shutdown complete.");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
