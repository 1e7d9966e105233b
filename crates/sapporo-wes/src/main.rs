// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! sapporo-wes service entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use sapporo_wes::config::{AppConfig, Args};
use sapporo_wes::db::Index;
use sapporo_wes::indexer::{Indexer, IndexerConfig};
use sapporo_wes::server::{AppState, router};

/// Window for in-flight HTTP requests to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sapporo_wes=info,tower_http=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("no .env file loaded: {}", e);
    }

    let args = Args::parse();
    let config = match AppConfig::resolve(args) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        addr = %config.addr,
        run_dir = %config.run_dir.display(),
        auth_enabled = config.auth.auth_enabled,
        snapshot_interval_mins = config.snapshot_interval_mins,
        "starting sapporo-wes"
    );

    tokio::fs::create_dir_all(&config.run_dir).await?;
    let index = Arc::new(Index::open(&config.run_dir).await?);

    let indexer = Indexer::new(
        sapporo_wes::run_store::RunStore::new(&config.run_dir),
        index.clone(),
        IndexerConfig {
            interval: Duration::from_secs(u64::from(config.snapshot_interval_mins) * 60),
            remove_older_than_days: config.run_remove_older_than_days,
        },
    );
    let indexer_shutdown = indexer.shutdown_handle();
    let indexer_handle = tokio::spawn(async move { indexer.run().await });

    let addr = config.addr;
    let state = AppState::new(config, index).await.map_err(|e| {
        anyhow::anyhow!("failed to initialize application state: {e}")
    })?;
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, "failed to bind: {e}");
            std::process::exit(1);
        }
    };
    info!("listening on http://{addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight requests");

    // In-flight workflow engines are detached children and are NOT signaled;
    // they run to completion and the dispatcher finishes their bookkeeping.
    let _ = shutdown_tx.send(());
    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("server error during shutdown: {e}"),
        Ok(Err(e)) => error!("server task panicked: {e}"),
        Err(_) => warn!(
            "in-flight requests did not drain within {}s, exiting anyway",
            SHUTDOWN_GRACE.as_secs()
        ),
    }

    indexer_shutdown.notify_one();
    if let Err(e) = indexer_handle.await {
        error!("indexer task panicked: {e}");
    }

    info!("sapporo-wes shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
