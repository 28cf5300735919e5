mod api;
mod archive;
mod config;
mod db;
mod error;
mod ingest;
mod odds;
mod source;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::routes::{router, ApiState};
use crate::api::StatusRegistry;
use crate::archive::ArchiveSweeper;
use crate::config::{Config, CHANNEL_CAPACITY, SPORTS_RETRY_SECS};
use crate::db::Store;
use crate::error::Result;
use crate::ingest::{supervise, WorkerContext};
use crate::source::{RequestGate, SourceClient};
use crate::types::OddsUpdate;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let store = Store::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Upstream client ---
    let gate = RequestGate::new(cfg.max_concurrent_requests);
    let source = Arc::new(SourceClient::new(&cfg, gate)?);

    let sport_ids = if cfg.sport_ids.is_empty() {
        discover_sports(&source).await
    } else {
        cfg.sport_ids.clone()
    };
    info!(
        "Polling {} sport(s): {:?} (max {} requests in flight, {:?} spacing)",
        sport_ids.len(),
        sport_ids,
        cfg.max_concurrent_requests,
        cfg.request_spacing,
    );

    // --- Channels ---
    let (notices_tx, notices_rx) = broadcast::channel(CHANNEL_CAPACITY);
    tokio::spawn(notice_logger(notices_rx));

    let status = Arc::new(StatusRegistry::new());

    // --- Spawn tasks ---

    // One supervised worker per sport
    let ctx = WorkerContext::new(&cfg, store.clone(), Arc::clone(&source), notices_tx, Arc::clone(&status));
    tokio::spawn(supervise(ctx, sport_ids));

    // Archive sweeper (background, every ARCHIVE_INTERVAL_MINUTES)
    let sweeper = ArchiveSweeper::new(
        store.clone(),
        cfg.archive_interval,
        cfg.archive_retention,
        Arc::clone(&status),
    );
    tokio::spawn(async move { sweeper.run().await });

    // HTTP health endpoint
    let app = router(ApiState { store, status });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Health endpoint listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Sport ids from the upstream sports listing, retried until it answers with at least one.
async fn discover_sports(source: &SourceClient) -> Vec<i64> {
    loop {
        match source.fetch_sport_ids().await {
            Ok(ids) if !ids.is_empty() => return ids,
            Ok(_) => warn!("Sports endpoint returned no sports"),
            Err(e) => warn!("Sport discovery failed: {e}"),
        }
        tokio::time::sleep(Duration::from_secs(SPORTS_RETRY_SECS)).await;
    }
}

/// Logs every committed odds update. Stands in for an external relay.
async fn notice_logger(mut rx: broadcast::Receiver<OddsUpdate>) {
    loop {
        match rx.recv().await {
            Ok(update) => debug!(
                sport_id = update.sport_id,
                event_id = update.event_id,
                table = update.table_updated,
                "Odds update: {} vs {} at {}",
                update.home_team,
                update.away_team,
                update.update_time,
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Odds update consumer lagged, skipped {skipped} notices");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
