use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::StatusRegistry;
use crate::config::{Config, WORKER_RESTART_SECS};
use crate::db::Store;
use crate::error::Result;
use crate::ingest::engine::IngestionEngine;
use crate::source::{Pacer, SourceClient};
use crate::types::{Cursor, OddsUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Fetching,
    Diffing,
    Persisting,
    Backoff,
}

/// Everything a sport worker shares with the rest of the process.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Store,
    pub source: Arc<SourceClient>,
    pub notices: broadcast::Sender<OddsUpdate>,
    pub status: Arc<StatusRegistry>,
    pub request_spacing: Duration,
    pub poll_delay: Duration,
    pub backoff: Duration,
    pub restart_delay: Duration,
}

impl WorkerContext {
    pub fn new(
        cfg: &Config,
        store: Store,
        source: Arc<SourceClient>,
        notices: broadcast::Sender<OddsUpdate>,
        status: Arc<StatusRegistry>,
    ) -> Self {
        Self {
            store,
            source,
            notices,
            status,
            request_spacing: cfg.request_spacing,
            poll_delay: cfg.poll_delay,
            backoff: cfg.backoff,
            restart_delay: Duration::from_secs(WORKER_RESTART_SECS),
        }
    }
}

/// Poll loop for one sport: fetch, diff, persist, record the cursor.
pub struct SportWorker {
    sport_id: i64,
    ctx: WorkerContext,
    engine: IngestionEngine,
    pacer: Pacer,
    cursor: Option<Cursor>,
}

impl SportWorker {
    pub fn new(sport_id: i64, ctx: WorkerContext) -> Self {
        let engine = IngestionEngine::new(sport_id, ctx.store.clone(), ctx.notices.clone());
        let pacer = Pacer::new(ctx.request_spacing);
        Self { sport_id, ctx, engine, pacer, cursor: None }
    }

    pub async fn run(mut self) {
        match self.ctx.store.last_cursor(self.sport_id).await {
            Ok(cursor) => self.cursor = cursor,
            Err(e) => warn!(sport_id = self.sport_id, "Could not load last cursor, starting from full board: {e}"),
        }
        info!(sport_id = self.sport_id, cursor = ?self.cursor, "Sport worker started");

        loop {
            match self.cycle().await {
                Ok(0) => {
                    self.set_state(WorkerState::Idle);
                    tokio::time::sleep(self.ctx.poll_delay).await;
                }
                Ok(_) => self.set_state(WorkerState::Idle),
                Err(e) => {
                    self.set_state(WorkerState::Backoff);
                    let failures = self.ctx.status.record_failure(self.sport_id);
                    warn!(
                        sport_id = self.sport_id,
                        failures,
                        "Poll cycle failed, backing off {:?}: {e}",
                        self.ctx.backoff,
                    );
                    tokio::time::sleep(self.ctx.backoff).await;
                    self.set_state(WorkerState::Idle);
                }
            }
        }
    }

    /// One fetch/diff/persist round. Returns the number of events received.
    /// The cursor only moves once the batch has been applied and logged.
    async fn cycle(&mut self) -> Result<usize> {
        self.set_state(WorkerState::Fetching);
        let batch = self
            .ctx
            .source
            .fetch(&mut self.pacer, self.sport_id, self.cursor.as_ref())
            .await?;

        for bad in &batch.malformed {
            warn!(sport_id = self.sport_id, "Skipping {bad}");
        }

        let events = batch.events.len();
        let mut snapshots = 0;
        if events > 0 {
            self.set_state(WorkerState::Diffing);
            let diffs = self.engine.diff_batch(&batch.events);

            self.set_state(WorkerState::Persisting);
            let report = self.engine.persist_batch(&batch.events, diffs).await;
            snapshots = report.snapshots;
            debug!(
                sport_id = self.sport_id,
                events = report.events,
                changed = report.changed,
                snapshots,
                "Batch applied"
            );
            if report.failed > 0 || report.archived > 0 {
                info!(
                    sport_id = self.sport_id,
                    failed = report.failed,
                    archived = report.archived,
                    "Batch applied with skipped events"
                );
            }
        }

        if let Some(cursor) = &batch.cursor {
            if self.cursor.as_ref() != Some(cursor) {
                self.ctx.store.record_cursor(self.sport_id, cursor).await?;
                self.cursor = Some(cursor.clone());
            }
        }

        self.ctx
            .status
            .record_success(self.sport_id, batch.cursor, snapshots);
        Ok(events)
    }

    fn set_state(&self, state: WorkerState) {
        self.ctx.status.set_state(self.sport_id, state);
    }
}

type WorkerExit = (i64, std::result::Result<(), JoinError>);

/// Runs one worker per sport and respawns any that stops, after `restart_delay`.
pub async fn supervise(ctx: WorkerContext, sport_ids: Vec<i64>) {
    let mut workers = JoinSet::new();
    for sport_id in sport_ids {
        spawn_worker(&mut workers, ctx.clone(), sport_id, Duration::ZERO);
    }

    while let Some(joined) = workers.join_next().await {
        let (sport_id, exit) = match joined {
            Ok(exit) => exit,
            Err(e) => {
                error!("Worker supervisor task failed: {e}");
                continue;
            }
        };

        match exit {
            Ok(()) => warn!(sport_id, "Sport worker stopped"),
            Err(e) if e.is_panic() => error!(sport_id, "Sport worker panicked"),
            Err(e) => error!(sport_id, "Sport worker aborted: {e}"),
        }
        ctx.status.record_restart(sport_id);
        info!(sport_id, "Restarting sport worker in {:?}", ctx.restart_delay);
        spawn_worker(&mut workers, ctx.clone(), sport_id, ctx.restart_delay);
    }
}

fn spawn_worker(workers: &mut JoinSet<WorkerExit>, ctx: WorkerContext, sport_id: i64, delay: Duration) {
    workers.spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let worker = SportWorker::new(sport_id, ctx);
        // Inner task so a panic surfaces as a JoinError instead of killing the wrapper.
        let exit = tokio::spawn(worker.run()).await;
        (sport_id, exit)
    });
}
