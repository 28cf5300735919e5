use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, error, info, warn};

use crate::api::StatusRegistry;
use crate::db::Store;
use crate::error::Result;
use crate::types::MarketKind;

const EVENT_COLUMNS: &str = "event_id, sport_id, league_id, league_name, league_uname, starts, \
     home_team, home_team_uname, away_team, away_team_uname, event_type, parent_id, \
     resulting_unit, is_have_odds, event_category, created_at, last_updated";

const PERIOD_COLUMNS: &str = "period_id, event_id, period_number, period_status, cutoff, \
     max_spread, max_money_line, max_total, max_team_total, line_id, number, created_at";

fn snapshot_columns(kind: MarketKind) -> &'static [&'static str] {
    match kind {
        MarketKind::MoneyLine => &["time", "period_id", "home_odds", "draw_odds", "away_odds", "max_bet"],
        MarketKind::Spread => &["time", "period_id", "handicap", "alt_line_id", "home_odds", "away_odds", "max_bet"],
        MarketKind::Total => &["time", "period_id", "points", "alt_line_id", "over_odds", "under_odds", "max_bet"],
        MarketKind::TeamTotal => &["time", "period_id", "team_type", "points", "over_odds", "under_odds", "max_bet"],
    }
}

/// An event is stale when it started before the cutoff and nothing sharing
/// its fixture identity starts at or after it. `?1` is the cutoff.
const STALE_PREDICATE: &str = r#"
    e.starts < ?1
    AND NOT EXISTS (
        SELECT 1 FROM events o
        WHERE COALESCE(o.parent_id, o.event_id) = COALESCE(e.parent_id, e.event_id)
          AND o.starts >= ?1
    )
"#;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub archived: usize,
    /// No longer eligible when re-checked inside the transaction; retried next sweep.
    pub conflicts: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived { snapshots: u64 },
    Conflict,
}

/// Periodically moves stale events, with their periods and snapshots, into the
/// archive tables. Each event moves in its own transaction.
pub struct ArchiveSweeper {
    store: Store,
    interval: Duration,
    retention: Duration,
    status: Arc<StatusRegistry>,
}

impl ArchiveSweeper {
    pub fn new(store: Store, interval: Duration, retention: Duration, status: Arc<StatusRegistry>) -> Self {
        Self { store, interval, retention, status }
    }

    /// Sweeps immediately, then every `interval`.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            ticker.tick().await;
            match self.sweep(Utc::now()).await {
                Ok(report) => self.status.record_sweep(report),
                Err(e) => error!("Archive sweep failed: {e}"),
            }
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff_ms = now.timestamp_millis() - self.retention.as_millis() as i64;

        let candidates: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT e.event_id FROM events e WHERE {STALE_PREDICATE} ORDER BY e.starts"
        ))
        .bind(cutoff_ms)
        .fetch_all(self.store.pool())
        .await?;

        let mut report = SweepReport { candidates: candidates.len(), ..Default::default() };
        if candidates.is_empty() {
            info!(cutoff_ms, "No events to archive");
            return Ok(report);
        }

        let archived_at = now.timestamp_millis();
        for event_id in candidates {
            match archive_event(&self.store, event_id, cutoff_ms, archived_at).await {
                Ok(ArchiveOutcome::Archived { snapshots }) => {
                    report.archived += 1;
                    debug!(event_id, snapshots, "Archived event");
                }
                Ok(ArchiveOutcome::Conflict) => {
                    report.conflicts += 1;
                    debug!(event_id, "Event no longer eligible for archive, skipping");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(event_id, "Failed to archive event: {e}");
                }
            }
        }

        info!(
            candidates = report.candidates,
            archived = report.archived,
            conflicts = report.conflicts,
            failed = report.failed,
            "Archive sweep complete"
        );
        Ok(report)
    }
}

/// Copies one event and everything under it into the archive, then deletes the
/// live rows, in a single transaction. Eligibility is re-checked first.
pub async fn archive_event(
    store: &Store,
    event_id: i64,
    cutoff_ms: i64,
    archived_at: i64,
) -> std::result::Result<ArchiveOutcome, sqlx::Error> {
    let mut writer = store.begin_write().await?;

    let outcome = archive_rows(&mut writer.tx, event_id, cutoff_ms, archived_at).await;
    match outcome {
        Ok(ArchiveOutcome::Conflict) => {
            writer.rollback().await?;
            Ok(ArchiveOutcome::Conflict)
        }
        Ok(archived) => {
            writer.commit().await?;
            Ok(archived)
        }
        Err(e) => {
            if let Err(rollback) = writer.rollback().await {
                warn!(event_id, "Rollback failed: {rollback}");
            }
            Err(e)
        }
    }
}

async fn archive_rows(
    conn: &mut SqliteConnection,
    event_id: i64,
    cutoff_ms: i64,
    archived_at: i64,
) -> std::result::Result<ArchiveOutcome, sqlx::Error> {
    let eligible: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM events e WHERE e.event_id = ?2 AND {STALE_PREDICATE}"
    ))
    .bind(cutoff_ms)
    .bind(event_id)
    .fetch_one(&mut *conn)
    .await?;
    if eligible == 0 {
        return Ok(ArchiveOutcome::Conflict);
    }

    sqlx::query(&format!(
        "INSERT INTO archive_events ({EVENT_COLUMNS}, archived_at) \
         SELECT {EVENT_COLUMNS}, ? FROM events WHERE event_id = ?"
    ))
    .bind(archived_at)
    .bind(event_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO archive_periods ({PERIOD_COLUMNS}, archived_at) \
         SELECT {PERIOD_COLUMNS}, ? FROM periods WHERE event_id = ?"
    ))
    .bind(archived_at)
    .bind(event_id)
    .execute(&mut *conn)
    .await?;

    let mut snapshots = 0;
    for kind in MarketKind::ALL {
        snapshots += move_snapshots(&mut *conn, kind, event_id, archived_at).await?;
    }

    sqlx::query("DELETE FROM periods WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM events WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut *conn)
        .await?;

    Ok(ArchiveOutcome::Archived { snapshots })
}

async fn move_snapshots(
    conn: &mut SqliteConnection,
    kind: MarketKind,
    event_id: i64,
    archived_at: i64,
) -> std::result::Result<u64, sqlx::Error> {
    let table = kind.table();
    let columns = snapshot_columns(kind);
    let target = columns.join(", ");
    let source = columns.iter().map(|c| format!("s.{c}")).collect::<Vec<_>>().join(", ");

    let copied = sqlx::query(&format!(
        "INSERT INTO archive_{table} ({target}, archived_at) \
         SELECT {source}, ? FROM {table} s \
         JOIN periods p ON p.period_id = s.period_id \
         WHERE p.event_id = ?"
    ))
    .bind(archived_at)
    .bind(event_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    sqlx::query(&format!(
        "DELETE FROM {table} WHERE period_id IN (SELECT period_id FROM periods WHERE event_id = ?)"
    ))
    .bind(event_id)
    .execute(&mut *conn)
    .await?;

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;
    use tokio::sync::broadcast;

    use super::*;
    use crate::db::store::memory_store;
    use crate::db::store::Projection;
    use crate::ingest::engine::IngestionEngine;
    use crate::types::{sample_event, Event};

    const RETENTION: Duration = Duration::from_secs(10 * 60);

    fn whole_millis(t: DateTime<Utc>) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap()
    }

    fn sweeper(store: &Store) -> ArchiveSweeper {
        ArchiveSweeper::new(store.clone(), RETENTION, RETENTION, Arc::new(StatusRegistry::new()))
    }

    async fn ingest(store: &Store, events: &[Event]) {
        let (tx, _rx) = broadcast::channel(256);
        IngestionEngine::new(1, store.clone(), tx).apply(events).await;
    }

    #[tokio::test]
    async fn empty_store_sweep_is_a_no_op() {
        let store = memory_store().await;
        let report = sweeper(&store).sweep(Utc::now()).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn first_sweep_runs_at_startup() {
        let store = memory_store().await;
        ingest(&store, &[sample_event(6001, Utc::now() - ChronoDuration::hours(3))]).await;

        let status = Arc::new(StatusRegistry::new());
        let hourly = ArchiveSweeper::new(store.clone(), Duration::from_secs(3600), RETENTION, Arc::clone(&status));
        let task = tokio::spawn(hourly.run());

        let mut swept = None;
        for _ in 0..200 {
            swept = status.last_sweep();
            if swept.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        let swept = swept.expect("no sweep before the first interval elapsed");
        assert_eq!(swept.report.archived, 1);
        assert_eq!(store.projection(6001).await.unwrap(), Projection::Archived);
    }

    #[tokio::test]
    async fn stale_event_moves_with_all_descendants() {
        let store = memory_store().await;
        let now = whole_millis(Utc::now());
        ingest(&store, &[sample_event(7001, now - ChronoDuration::hours(3))]).await;

        let report = sweeper(&store).sweep(now).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.archived, 1);
        assert_eq!(store.projection(7001).await.unwrap(), Projection::Archived);
        for kind in MarketKind::ALL {
            assert_eq!(store.snapshot_counts(7001, kind).await.unwrap(), (0, 1), "{kind}");
        }

        let periods: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM archive_periods WHERE event_id = 7001")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(periods, 1);
        assert!(store.live_periods(7001).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upcoming_sibling_keeps_the_fixture_live() {
        let store = memory_store().await;
        let now = whole_millis(Utc::now());
        let parent = sample_event(8001, now - ChronoDuration::hours(2));
        let mut live = sample_event(8002, now + ChronoDuration::hours(1));
        live.parent_id = Some(8001);
        ingest(&store, &[parent, live]).await;

        let report = sweeper(&store).sweep(now).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(store.projection(8001).await.unwrap(), Projection::Live);
        assert_eq!(store.projection(8002).await.unwrap(), Projection::Live);
    }

    #[tokio::test]
    async fn ineligible_event_is_a_conflict() {
        let store = memory_store().await;
        let now = whole_millis(Utc::now());
        ingest(&store, &[sample_event(9001, now + ChronoDuration::hours(1))]).await;

        let cutoff_ms = (now - ChronoDuration::minutes(10)).timestamp_millis();
        let outcome = archive_event(&store, 9001, cutoff_ms, now.timestamp_millis()).await.unwrap();
        assert_eq!(outcome, ArchiveOutcome::Conflict);
        assert_eq!(store.projection(9001).await.unwrap(), Projection::Live);

        let gone = archive_event(&store, 424242, cutoff_ms, now.timestamp_millis()).await.unwrap();
        assert_eq!(gone, ArchiveOutcome::Conflict);
    }

    #[tokio::test]
    async fn archived_event_is_not_revived_by_ingestion() {
        let store = memory_store().await;
        let now = whole_millis(Utc::now());
        let mut event = sample_event(9101, now - ChronoDuration::hours(3));
        ingest(&store, std::slice::from_ref(&event)).await;
        sweeper(&store).sweep(now).await.unwrap();

        event.periods[0].totals[0].over = Some(1.75);
        ingest(&store, std::slice::from_ref(&event)).await;

        assert_eq!(store.projection(9101).await.unwrap(), Projection::Archived);
        assert_eq!(store.snapshot_counts(9101, MarketKind::Total).await.unwrap(), (0, 1));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_sweep_partitions_events(
            layout in prop::collection::vec((-300i64..300, any::<bool>()), 1..8),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let store = memory_store().await;
                let now = whole_millis(Utc::now());
                let family = 10_000;

                let events: Vec<Event> = layout
                    .iter()
                    .enumerate()
                    .map(|(i, (offset, linked))| {
                        let mut e = sample_event(family + i as i64, now + ChronoDuration::minutes(*offset));
                        e.parent_id = linked.then_some(family);
                        e
                    })
                    .collect();
                ingest(&store, &events).await;

                let mut before = 0;
                for e in &events {
                    before += store.total_snapshots(e.event_id).await.unwrap();
                }

                let report = sweeper(&store).sweep(now).await.unwrap();
                assert_eq!(report.failed, 0);
                assert_eq!(report.conflicts, 0);

                let cutoff = now - ChronoDuration::minutes(10);
                let identity = |e: &Event| e.parent_id.unwrap_or(e.event_id);
                let mut after = 0;
                for e in &events {
                    let fresh_sibling = events
                        .iter()
                        .any(|o| identity(o) == identity(e) && o.starts >= cutoff);
                    let expected = if e.starts < cutoff && !fresh_sibling {
                        Projection::Archived
                    } else {
                        Projection::Live
                    };
                    assert_eq!(store.projection(e.event_id).await.unwrap(), expected, "event {}", e.event_id);
                    after += store.total_snapshots(e.event_id).await.unwrap();
                }
                assert_eq!(before, after);
            });
        }
    }
}
