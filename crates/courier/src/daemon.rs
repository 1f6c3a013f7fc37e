//! The dispatch daemon.

use std::sync::Arc;

use courier_dispatch::{DispatchConfig, Dispatcher};
use courier_platforms::AdapterRegistry;
use courier_store::{MemoryStore, PgStore, Store};
use miette::Result;
use tokio::sync::watch;
use tracing::{info, warn};

/// Run the daemon until interrupted.
pub async fn run(
    database_url: Option<&str>,
    max_connections: u32,
    config: DispatchConfig,
) -> Result<()> {
    info!("starting Courier daemon");

    let store: Arc<dyn Store> = match database_url {
        Some(url) => {
            let store = PgStore::connect(url, max_connections)
                .await
                .map_err(|e| miette::miette!("failed to connect to database: {}", e))?;
            store
                .migrate()
                .await
                .map_err(|e| miette::miette!("failed to apply migrations: {}", e))?;
            Arc::new(store)
        }
        None => {
            warn!("no database configured, using in-memory store; state is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = AdapterRegistry::from_env()
        .map_err(|e| miette::miette!("failed to build platform adapters: {}", e))?;

    info!(
        workers = config.worker_count,
        max_attempts = config.max_attempts,
        publish_timeout_secs = config.publish_timeout.as_secs(),
        "dispatch configuration"
    );
    let dispatcher = Arc::new(
        Dispatcher::new(config, store, registry).map_err(|e| miette::miette!("{}", e))?,
    );
    let running = dispatcher.start();

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    #[cfg(unix)]
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    info!("received SIGTERM");
                    let _ = shutdown_tx.send(true);
                }
                Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
            }
        });
    }

    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }

    running.shutdown().await;
    info!("Courier daemon stopped");
    Ok(())
}
