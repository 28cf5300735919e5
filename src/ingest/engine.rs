use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::db::{EventWrite, Store};
use crate::error::PersistError;
use crate::ingest::cache::{CacheUndo, ChangeCache};
use crate::odds::{calculate_vig_free_odds, get_sum_vig, no_vig_money_line, VigMarket};
use crate::types::{ChangeSet, Event, LineKey, LineValue, MarketKind, OddsUpdate};

/// Lines that moved for one event, plus what the cache looked like before.
#[derive(Debug, Default)]
pub struct EventDiff {
    pub changes: ChangeSet,
    undo: CacheUndo,
}

/// Outcome of applying one batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub events: usize,
    /// Events with at least one snapshot written.
    pub changed: usize,
    pub snapshots: usize,
    /// Skipped because they already live in the archive.
    pub archived: usize,
    /// Rolled back; their lines are retried on the next batch.
    pub failed: usize,
}

/// Diffs and persists batches for one sport. Owns that sport's change cache.
pub struct IngestionEngine {
    sport_id: i64,
    store: Store,
    cache: ChangeCache,
    first_pass: bool,
    last_stamp: Option<DateTime<Utc>>,
    notices: broadcast::Sender<OddsUpdate>,
}

impl IngestionEngine {
    pub fn new(sport_id: i64, store: Store, notices: broadcast::Sender<OddsUpdate>) -> Self {
        Self {
            sport_id,
            store,
            cache: ChangeCache::new(),
            first_pass: true,
            last_stamp: None,
            notices,
        }
    }

    /// Runs every line of `event` through the cache. No storage access.
    pub fn diff_event(&mut self, event: &Event) -> EventDiff {
        let mut diff = EventDiff::default();
        let id = event.event_id;

        for period in &event.periods {
            let n = period.number;
            if let Some(ml) = &period.money_line {
                self.observe(LineKey::money_line(id, n), ml.into(), &mut diff);
            }
            for s in &period.spreads {
                self.observe(LineKey::spread(id, n, s.handicap), s.into(), &mut diff);
            }
            for t in &period.totals {
                self.observe(LineKey::total(id, n, t.points), t.into(), &mut diff);
            }
            for tt in &period.team_totals {
                self.observe(LineKey::team_total(id, n, tt.team), tt.into(), &mut diff);
            }
        }
        diff
    }

    fn observe(&mut self, key: LineKey, value: LineValue, diff: &mut EventDiff) {
        if self.cache.observe(key, value, &mut diff.undo) {
            diff.changes.insert(key);
        }
    }

    pub fn diff_batch(&mut self, events: &[Event]) -> Vec<EventDiff> {
        events.iter().map(|e| self.diff_event(e)).collect()
    }

    /// Writes each event in its own transaction. A failed event is rolled back
    /// and its cache entries restored; the rest of the batch carries on.
    pub async fn persist_batch(&mut self, events: &[Event], diffs: Vec<EventDiff>) -> BatchReport {
        let mut report = BatchReport { events: events.len(), ..Default::default() };
        let mut changed_fixtures = Vec::new();

        for (event, diff) in events.iter().zip(diffs) {
            let now = self.next_stamp();
            match self.persist(event, &diff.changes, now).await {
                Ok(EventWrite::Written(counts)) => {
                    if counts.total() == 0 {
                        continue;
                    }
                    report.changed += 1;
                    report.snapshots += counts.total();
                    for table in counts.tables_updated() {
                        self.publish(event, table, now);
                    }
                    if !self.first_pass {
                        log_fair_odds(event, &diff.changes);
                        info!(
                            sport_id = self.sport_id,
                            event_id = event.event_id,
                            "Updates detected for: {} ({})",
                            event.fixture(),
                            diff.changes.describe(),
                        );
                        changed_fixtures.push(event.fixture());
                    }
                }
                Ok(EventWrite::Archived) => {
                    self.cache.revert(diff.undo);
                    report.archived += 1;
                    debug!(event_id = event.event_id, "Skipping archived event");
                }
                Err(e) => {
                    self.cache.revert(diff.undo);
                    report.failed += 1;
                    error!(sport_id = self.sport_id, event_id = e.event_id, "{e}");
                }
            }
        }

        if self.first_pass {
            self.first_pass = false;
            self.log_initial_load().await;
        } else if !changed_fixtures.is_empty() {
            info!(
                sport_id = self.sport_id,
                events = changed_fixtures.len(),
                "Changes detected in: {}",
                changed_fixtures.join(", "),
            );
        }

        report
    }

    async fn persist(
        &self,
        event: &Event,
        changes: &ChangeSet,
        now: DateTime<Utc>,
    ) -> Result<EventWrite, PersistError> {
        self.store
            .write_event(event, changes, now)
            .await
            .map_err(|source| PersistError { event_id: event.event_id, source })
    }

    fn publish(&self, event: &Event, table: &'static str, now: DateTime<Utc>) {
        // No receivers is fine.
        let _ = self.notices.send(OddsUpdate {
            sport_id: event.sport_id,
            event_id: event.event_id,
            home_team: event.home.clone(),
            away_team: event.away.clone(),
            table_updated: table,
            update_time: now,
        });
    }

    /// Snapshot time for the next event, never earlier than the previous one.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    async fn log_initial_load(&self) {
        match self.store.table_counts().await {
            Ok(counts) => {
                let summary: Vec<String> =
                    counts.iter().map(|(table, n)| format!("{table}={n}")).collect();
                info!(
                    sport_id = self.sport_id,
                    cached_lines = self.cache.len(),
                    "Initial data load complete: {}",
                    summary.join(" "),
                );
            }
            Err(e) => error!(sport_id = self.sport_id, "Failed to read table counts: {e}"),
        }
    }
}

#[cfg(test)]
impl IngestionEngine {
    /// Diffs the whole batch, then writes it.
    pub(crate) async fn apply(&mut self, events: &[Event]) -> BatchReport {
        let diffs = self.diff_batch(events);
        self.persist_batch(events, diffs).await
    }
}

/// Margin and fair prices for one changed line. `point` is the handicap or
/// total points; money lines have none.
#[derive(Debug, Clone, PartialEq)]
struct FairQuote {
    kind: MarketKind,
    period: i32,
    point: Option<f64>,
    vig: Option<f64>,
    fair: Option<Vec<f64>>,
}

fn fair_quotes(event: &Event, changes: &ChangeSet) -> Vec<FairQuote> {
    let id = event.event_id;
    let mut quotes = Vec::new();

    for period in &event.periods {
        let n = period.number;
        if let Some(ml) = &period.money_line {
            if changes.contains(&LineKey::money_line(id, n)) {
                let vig = match (ml.home, ml.draw, ml.away) {
                    (Some(h), Some(d), Some(a)) if ml.three_way => {
                        get_sum_vig(VigMarket::MoneyLine, &[h, d, a]).ok()
                    }
                    _ => None,
                };
                let fair = no_vig_money_line(ml.home, ml.draw, ml.away, ml.three_way).ok();
                quotes.push(FairQuote { kind: MarketKind::MoneyLine, period: n, point: None, vig, fair });
            }
        }
        for s in &period.spreads {
            if changes.contains(&LineKey::spread(id, n, s.handicap)) {
                if let (Some(home), Some(away)) = (s.home, s.away) {
                    quotes.push(two_way(MarketKind::Spread, VigMarket::Spread, n, s.handicap, home, away));
                }
            }
        }
        for t in &period.totals {
            if changes.contains(&LineKey::total(id, n, t.points)) {
                if let (Some(over), Some(under)) = (t.over, t.under) {
                    quotes.push(two_way(MarketKind::Total, VigMarket::Total, n, t.points, over, under));
                }
            }
        }
    }
    quotes
}

fn two_way(kind: MarketKind, market: VigMarket, period: i32, point: f64, a: f64, b: f64) -> FairQuote {
    FairQuote {
        kind,
        period,
        point: Some(point),
        vig: get_sum_vig(market, &[a, b]).ok(),
        fair: calculate_vig_free_odds(a, b).ok().map(|(x, y)| vec![x, y]),
    }
}

fn log_fair_odds(event: &Event, changes: &ChangeSet) {
    for q in fair_quotes(event, changes) {
        debug!(
            event_id = event.event_id,
            period = q.period,
            point = ?q.point,
            vig = ?q.vig,
            fair = ?q.fair,
            "{}",
            q.kind
        );
    }
}
