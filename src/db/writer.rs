use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::warn;

use crate::db::Store;
use crate::types::{uname, ChangeSet, Event, LineKey, MarketKind, Period};

/// Snapshot rows written for one event, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub money_lines: usize,
    pub spreads: usize,
    pub totals: usize,
    pub team_totals: usize,
}

impl SnapshotCounts {
    pub fn get(&self, kind: MarketKind) -> usize {
        match kind {
            MarketKind::MoneyLine => self.money_lines,
            MarketKind::Spread => self.spreads,
            MarketKind::Total => self.totals,
            MarketKind::TeamTotal => self.team_totals,
        }
    }

    pub fn total(&self) -> usize {
        self.money_lines + self.spreads + self.totals + self.team_totals
    }

    /// Tables that received at least one row.
    pub fn tables_updated(&self) -> impl Iterator<Item = &'static str> + '_ {
        MarketKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind) > 0)
            .map(MarketKind::table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventWrite {
    Written(SnapshotCounts),
    /// The event already lives in the archive; nothing was written.
    Archived,
}

impl Store {
    /// Upserts the event and its periods and writes a snapshot for every line in
    /// `changes`, all stamped `now`, in a single transaction. Any error rolls
    /// the whole event back.
    pub async fn write_event(
        &self,
        event: &Event,
        changes: &ChangeSet,
        now: DateTime<Utc>,
    ) -> Result<EventWrite, sqlx::Error> {
        let mut writer = self.begin_write().await?;

        let written = write_rows(&mut writer.tx, event, changes, now.timestamp_millis()).await;
        match written {
            Ok(EventWrite::Archived) => {
                writer.rollback().await?;
                Ok(EventWrite::Archived)
            }
            Ok(written) => {
                writer.commit().await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rollback) = writer.rollback().await {
                    warn!(event_id = event.event_id, "Rollback failed: {rollback}");
                }
                Err(e)
            }
        }
    }
}

async fn write_rows(
    conn: &mut SqliteConnection,
    event: &Event,
    changes: &ChangeSet,
    now_ms: i64,
) -> Result<EventWrite, sqlx::Error> {
    let archived: Option<i64> = sqlx::query_scalar("SELECT 1 FROM archive_events WHERE event_id = ?")
        .bind(event.event_id)
        .fetch_optional(&mut *conn)
        .await?;
    if archived.is_some() {
        return Ok(EventWrite::Archived);
    }

    upsert_event(&mut *conn, event, now_ms).await?;

    let mut counts = SnapshotCounts::default();
    for period in &event.periods {
        let period_id = upsert_period(&mut *conn, event.event_id, period, now_ms).await?;
        insert_snapshots(&mut *conn, event.event_id, period_id, period, changes, now_ms, &mut counts)
            .await?;
    }
    Ok(EventWrite::Written(counts))
}

async fn upsert_event(conn: &mut SqliteConnection, e: &Event, now_ms: i64) -> Result<(), sqlx::Error> {
    let event_type = e.event_type.to_string();
    let category = e.category().to_string();

    sqlx::query(
        r#"
        INSERT INTO events (
            event_id, sport_id, league_id, league_name, league_uname, starts,
            home_team, home_team_uname, away_team, away_team_uname,
            event_type, parent_id, resulting_unit, is_have_odds, event_category,
            created_at, last_updated
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (event_id) DO UPDATE SET
            starts = excluded.starts,
            home_team = excluded.home_team,
            home_team_uname = excluded.home_team_uname,
            away_team = excluded.away_team,
            away_team_uname = excluded.away_team_uname,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(e.event_id)
    .bind(e.sport_id)
    .bind(e.league_id)
    .bind(&e.league_name)
    .bind(uname(&e.league_name))
    .bind(e.starts.timestamp_millis())
    .bind(&e.home)
    .bind(uname(&e.home))
    .bind(&e.away)
    .bind(uname(&e.away))
    .bind(event_type)
    .bind(e.parent_id)
    .bind(&e.resulting_unit)
    .bind(e.is_have_odds)
    .bind(category)
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Returns the period's stable surrogate id.
async fn upsert_period(
    conn: &mut SqliteConnection,
    event_id: i64,
    p: &Period,
    now_ms: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO periods (
            event_id, period_number, period_status, cutoff,
            max_spread, max_money_line, max_total, max_team_total,
            line_id, number, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (event_id, period_number) DO UPDATE SET
            period_status = excluded.period_status,
            cutoff = excluded.cutoff,
            max_spread = excluded.max_spread,
            max_money_line = excluded.max_money_line,
            max_total = excluded.max_total,
            max_team_total = excluded.max_team_total,
            line_id = excluded.line_id,
            number = excluded.number
        RETURNING period_id
        "#,
    )
    .bind(event_id)
    .bind(p.number)
    .bind(p.status)
    .bind(p.cutoff.map(|c| c.timestamp_millis()))
    .bind(p.limits.max_spread)
    .bind(p.limits.max_money_line)
    .bind(p.limits.max_total)
    .bind(p.limits.max_team_total)
    .bind(p.line_id)
    .bind(p.line_number)
    .bind(now_ms)
    .fetch_one(&mut *conn)
    .await
}

async fn insert_snapshots(
    conn: &mut SqliteConnection,
    event_id: i64,
    period_id: i64,
    p: &Period,
    changes: &ChangeSet,
    now_ms: i64,
    counts: &mut SnapshotCounts,
) -> Result<(), sqlx::Error> {
    if let Some(ml) = &p.money_line {
        if changes.contains(&LineKey::money_line(event_id, p.number)) {
            sqlx::query(
                r#"
                INSERT INTO money_lines (time, period_id, home_odds, draw_odds, away_odds, max_bet)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(now_ms)
            .bind(period_id)
            .bind(ml.home)
            .bind(ml.draw)
            .bind(ml.away)
            .bind(p.limits.max_money_line)
            .execute(&mut *conn)
            .await?;
            counts.money_lines += 1;
        }
    }

    for s in &p.spreads {
        if !changes.contains(&LineKey::spread(event_id, p.number, s.handicap)) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO spreads (time, period_id, handicap, alt_line_id, home_odds, away_odds, max_bet)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now_ms)
        .bind(period_id)
        .bind(s.handicap)
        .bind(s.alt_line_id)
        .bind(s.home)
        .bind(s.away)
        .bind(s.max_bet)
        .execute(&mut *conn)
        .await?;
        counts.spreads += 1;
    }

    for t in &p.totals {
        if !changes.contains(&LineKey::total(event_id, p.number, t.points)) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO totals (time, period_id, points, alt_line_id, over_odds, under_odds, max_bet)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now_ms)
        .bind(period_id)
        .bind(t.points)
        .bind(t.alt_line_id)
        .bind(t.over)
        .bind(t.under)
        .bind(t.max_bet)
        .execute(&mut *conn)
        .await?;
        counts.totals += 1;
    }

    for tt in &p.team_totals {
        if !changes.contains(&LineKey::team_total(event_id, p.number, tt.team)) {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO team_totals (time, period_id, team_type, points, over_odds, under_odds, max_bet)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(now_ms)
        .bind(period_id)
        .bind(tt.team.as_str())
        .bind(tt.points)
        .bind(tt.over)
        .bind(tt.under)
        .bind(p.limits.max_team_total)
        .execute(&mut *conn)
        .await?;
        counts.team_totals += 1;
    }

    Ok(())
}
