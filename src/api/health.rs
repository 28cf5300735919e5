//! Shared status for the /health endpoint.
//! Written by sport workers and the archive sweeper, read by the API.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::archive::SweepReport;
use crate::ingest::WorkerState;
use crate::types::Cursor;

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub last_cursor: Option<Cursor>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub snapshots_written: u64,
    pub restarts: u32,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Idle,
            last_cursor: None,
            last_success: None,
            consecutive_failures: 0,
            snapshots_written: 0,
            restarts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepStatus {
    pub finished_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: SweepReport,
}

#[derive(Debug, Default)]
pub struct StatusRegistry {
    workers: DashMap<i64, WorkerStatus>,
    last_sweep: RwLock<Option<SweepStatus>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, sport_id: i64, state: WorkerState) {
        self.workers.entry(sport_id).or_default().state = state;
    }

    pub fn record_success(&self, sport_id: i64, cursor: Option<Cursor>, snapshots: usize) {
        let mut status = self.workers.entry(sport_id).or_default();
        if cursor.is_some() {
            status.last_cursor = cursor;
        }
        status.last_success = Some(Utc::now());
        status.consecutive_failures = 0;
        status.snapshots_written += snapshots as u64;
    }

    /// Returns the failure streak including this one.
    pub fn record_failure(&self, sport_id: i64) -> u32 {
        let mut status = self.workers.entry(sport_id).or_default();
        status.consecutive_failures += 1;
        status.consecutive_failures
    }

    pub fn record_restart(&self, sport_id: i64) {
        self.workers.entry(sport_id).or_default().restarts += 1;
    }

    pub fn record_sweep(&self, report: SweepReport) {
        if let Ok(mut last) = self.last_sweep.write() {
            *last = Some(SweepStatus { finished_at: Utc::now(), report });
        }
    }

    /// Worker statuses ordered by sport id.
    pub fn workers(&self) -> Vec<(i64, WorkerStatus)> {
        let mut all: Vec<_> = self
            .workers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        all.sort_by_key(|(sport_id, _)| *sport_id);
        all
    }

    pub fn last_sweep(&self) -> Option<SweepStatus> {
        self.last_sweep.read().ok().and_then(|s| s.clone())
    }
}

#[cfg(test)]
impl StatusRegistry {
    pub(crate) fn worker(&self, sport_id: i64) -> Option<WorkerStatus> {
        self.workers.get(&sport_id).map(|s| s.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_failure_streak() {
        let status = StatusRegistry::new();
        assert_eq!(status.record_failure(29), 1);
        assert_eq!(status.record_failure(29), 2);
        status.record_success(29, Some(Cursor("1700000000".into())), 12);
        status.record_success(29, None, 3);

        let worker = status.worker(29).unwrap();
        assert_eq!(worker.consecutive_failures, 0);
        assert_eq!(worker.snapshots_written, 15);
        assert_eq!(worker.last_cursor, Some(Cursor("1700000000".into())));
    }

    #[test]
    fn workers_are_listed_by_sport() {
        let status = StatusRegistry::new();
        status.set_state(29, WorkerState::Fetching);
        status.set_state(3, WorkerState::Backoff);
        let ids: Vec<i64> = status.workers().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![3, 29]);
        assert!(status.last_sweep().is_none());
    }
}
