//! nodepulse kernel - collects agent reports and serves the dashboard API
//!
//! Startup: config, SQLite history, retention sweeper, HTTP server.
//! Shutdown (ctrl-c or SIGTERM): stop accepting, give in-flight requests a
//! short grace period, stop the sweeper, close the database.

mod aggregate;
mod config;
mod http;
mod ingest;
mod models;
mod singleflight;
mod state;
mod store;
mod sweeper;

use crate::aggregate::Aggregator;
use crate::config::load_config;
use crate::http::{build_router, AppState};
use crate::ingest::Ingestor;
use crate::state::LiveCache;
use crate::store::MeasureStore;
use crate::sweeper::RetentionSweeper;

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("nodepulse kernel starting...");

    let cfg = load_config().await.context("Failed to load kernel config")?;
    let store = Arc::new(
        MeasureStore::open(&cfg.database)
            .with_context(|| format!("Failed to open database {}", cfg.database.display()))?,
    );
    info!(
        records = store.measure_count(None)?,
        nodes = cfg.nodes.len(),
        "history loaded"
    );

    let cache = Arc::new(LiveCache::new());
    let state = AppState {
        ingestor: Arc::new(Ingestor::new(cfg.token.clone(), cache.clone(), store.clone())),
        aggregator: Arc::new(Aggregator::new(
            cache.clone(),
            store.clone(),
            cfg.nodes.clone(),
            cfg.alive_timeout_secs,
        )),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Arc::new(RetentionSweeper::new(store.clone(), cache, cfg.nodes.clone()))
        .spawn(shutdown_rx.clone());

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.listen))?;
    info!("kernel listening on {}", cfg.listen);

    let mut server_rx = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, build_router(state))
            .with_graceful_shutdown(async move {
                let _ = server_rx.wait_for(|stop| *stop).await;
            })
            .await
    });

    run_until_shutdown(shutdown_signal(), server, sweeper, shutdown_tx, &store, SHUTDOWN_GRACE).await
}

/// Waits for `signal` or an early server exit, then stops the server within
/// `grace`, joins the sweeper and closes the store
async fn run_until_shutdown(
    signal: impl Future<Output = ()>,
    mut server: JoinHandle<std::io::Result<()>>,
    sweeper: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    store: &MeasureStore,
    grace: Duration,
) -> Result<()> {
    let early_exit = tokio::select! {
        _ = signal => {
            info!("shutdown signal received");
            None
        }
        res = &mut server => Some(res),
    };
    let _ = shutdown_tx.send(true);

    match early_exit {
        Some(res) => log_server_exit(res),
        None => match tokio::time::timeout(grace, &mut server).await {
            Ok(res) => log_server_exit(res),
            Err(_) => {
                warn!("requests still running after {:?}, aborting them", grace);
                server.abort();
            }
        },
    }

    if let Err(e) = sweeper.await {
        error!("retention sweeper task failed: {}", e);
    }
    store.close().context("Failed to close database")?;
    info!("kernel stopped");
    Ok(())
}

fn log_server_exit(res: Result<std::io::Result<()>, JoinError>) {
    match res {
        Ok(Ok(())) => info!("http server stopped"),
        Ok(Err(e)) => error!("http server error: {}", e),
        Err(e) => error!("http server task failed: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
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
}
