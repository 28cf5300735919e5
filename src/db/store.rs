use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

#[cfg(test)]
use crate::db::models::{EventRow, PeriodRow};
use crate::db::models::RequestLogRow;
use crate::error::Result;
use crate::types::{Cursor, MarketKind};

/// Handle to the odds database. Cheap to clone; all clones share one pool
/// and one write lock.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

/// A write transaction that holds the store's write lock until it is committed
/// or rolled back.
pub struct WriteTx<'a> {
    pub tx: Transaction<'static, Sqlite>,
    _guard: MutexGuard<'a, ()>,
}

impl WriteTx<'_> {
    pub async fn commit(self) -> std::result::Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> std::result::Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool and applies pending migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool, write_lock: Arc::new(Mutex::new(())) })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Opens a transaction for a multi-statement write. Writers queue on the
    /// store's lock, so a transaction never has to upgrade a read lock while
    /// another connection is writing.
    pub async fn begin_write(&self) -> std::result::Result<WriteTx<'_>, sqlx::Error> {
        let guard = self.write_lock.lock().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTx { tx, _guard: guard })
    }

    // -----------------------------------------------------------------------
    // Cursor log
    // -----------------------------------------------------------------------

    /// Most recently recorded cursor for `sport_id`, if any.
    pub async fn last_cursor(&self, sport_id: i64) -> Result<Option<Cursor>> {
        let row = sqlx::query_as::<_, RequestLogRow>(
            r#"
            SELECT id, sport_id, last_call, created_at
            FROM api_request_logs
            WHERE sport_id = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(sport_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Cursor(r.last_call)))
    }

    /// Records `cursor` as applied. Returns false when the same cursor is already logged.
    pub async fn record_cursor(&self, sport_id: i64, cursor: &Cursor) -> Result<bool> {
        let _writer = self.write_lock.lock().await;
        let inserted = sqlx::query(
            r#"
            INSERT INTO api_request_logs (sport_id, last_call, created_at)
            SELECT ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM api_request_logs WHERE sport_id = ? AND last_call = ?
            )
            "#,
        )
        .bind(sport_id)
        .bind(&cursor.0)
        .bind(now_ms())
        .bind(sport_id)
        .bind(&cursor.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(sport_id, cursor = %cursor, "request log already exists, no insert performed");
        }
        Ok(inserted > 0)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Row counts for the live tables, in schema order.
    pub async fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::new();
        for table in ["events", "periods"]
            .into_iter()
            .chain(MarketKind::ALL.iter().map(|k| k.table()))
        {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            counts.push((table, count));
        }
        Ok(counts)
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
pub(crate) async fn memory_store() -> Store {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    Store::from_pool(pool).await.unwrap()
}

/// A store on a fresh database file in the temp dir, opened the way
/// production opens it. Pair with [`remove_file_store`].
#[cfg(test)]
pub(crate) async fn file_store(name: &str) -> (Store, std::path::PathBuf) {
    let file = format!("odds-{name}-{}-{}.db", std::process::id(), now_ms());
    let path = std::env::temp_dir().join(file);
    let store = Store::connect(path.to_str().unwrap()).await.unwrap();
    (store, path)
}

#[cfg(test)]
pub(crate) async fn remove_file_store(store: Store, path: &std::path::Path) {
    store.pool().close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

/// Which projection currently holds an event.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Projection {
    Live,
    Archived,
    /// Never seen.
    Missing,
    /// Only possible mid-sweep; never observable after a commit.
    Both,
}

#[cfg(test)]
impl Store {
    pub(crate) async fn live_event(&self, event_id: i64) -> Result<Option<EventRow>> {
        let row = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, sport_id, league_id, league_name, starts, home_team, away_team,
                   event_type, parent_id, event_category, last_updated
            FROM events
            WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub(crate) async fn live_periods(&self, event_id: i64) -> Result<Vec<PeriodRow>> {
        let rows = sqlx::query_as::<_, PeriodRow>(
            r#"
            SELECT period_id, event_id, period_number, period_status, cutoff, max_money_line
            FROM periods
            WHERE event_id = ?
            ORDER BY period_number
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub(crate) async fn projection(&self, event_id: i64) -> Result<Projection> {
        let (live, archived): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM events WHERE event_id = ?),
                (SELECT COUNT(*) FROM archive_events WHERE event_id = ?)
            "#,
        )
        .bind(event_id)
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(match (live > 0, archived > 0) {
            (true, false) => Projection::Live,
            (false, true) => Projection::Archived,
            (false, false) => Projection::Missing,
            (true, true) => Projection::Both,
        })
    }

    /// Snapshot rows for an event in `table` (live) and `archive_<table>`.
    pub(crate) async fn snapshot_counts(&self, event_id: i64, kind: MarketKind) -> Result<(i64, i64)> {
        let table = kind.table();
        let sql = format!(
            r#"
            SELECT
                (SELECT COUNT(*) FROM {table} s
                   JOIN periods p ON p.period_id = s.period_id
                  WHERE p.event_id = ?),
                (SELECT COUNT(*) FROM archive_{table} s
                   JOIN archive_periods p ON p.period_id = s.period_id
                  WHERE p.event_id = ?)
            "#
        );
        let counts: (i64, i64) = sqlx::query_as(&sql)
            .bind(event_id)
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(counts)
    }

    /// Total snapshot rows (live + archived) for an event across every market kind.
    pub(crate) async fn total_snapshots(&self, event_id: i64) -> Result<i64> {
        let mut total = 0;
        for kind in MarketKind::ALL {
            let (live, archived) = self.snapshot_counts(event_id, kind).await?;
            total += live + archived;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cold_start_has_no_cursor() {
        let store = memory_store().await;
        assert_eq!(store.last_cursor(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn latest_cursor_wins_per_sport() {
        let store = memory_store().await;
        assert!(store.record_cursor(1, &Cursor("100".into())).await.unwrap());
        assert!(store.record_cursor(1, &Cursor("250".into())).await.unwrap());
        assert!(store.record_cursor(2, &Cursor("900".into())).await.unwrap());

        assert_eq!(store.last_cursor(1).await.unwrap(), Some(Cursor("250".into())));
        assert_eq!(store.last_cursor(2).await.unwrap(), Some(Cursor("900".into())));
    }

    #[tokio::test]
    async fn duplicate_cursor_is_not_logged_twice() {
        let store = memory_store().await;
        assert!(store.record_cursor(1, &Cursor("100".into())).await.unwrap());
        assert!(!store.record_cursor(1, &Cursor("100".into())).await.unwrap());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_request_logs")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn fresh_database_counts_are_zero() {
        let store = memory_store().await;
        let counts = store.table_counts().await.unwrap();
        assert_eq!(counts.len(), 6);
        assert!(counts.iter().all(|(_, n)| *n == 0));
        assert_eq!(store.projection(7).await.unwrap(), Projection::Missing);
    }
}
