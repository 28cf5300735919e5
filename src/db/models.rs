/// Database row types matching `migrations/0001_init.sql`.
/// Timestamps are epoch milliseconds.

#[derive(Debug, sqlx::FromRow)]
pub struct RequestLogRow {
    pub id: i64,
    pub sport_id: i64,
    pub last_call: String,
    pub created_at: i64,
}

#[cfg(test)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub event_id: i64,
    pub sport_id: i64,
    pub league_id: Option<i64>,
    pub league_name: Option<String>,
    pub starts: i64,
    pub home_team: String,
    pub away_team: String,
    pub event_type: Option<String>,
    pub parent_id: Option<i64>,
    pub event_category: String,
    pub last_updated: i64,
}

#[cfg(test)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PeriodRow {
    pub period_id: i64,
    pub event_id: i64,
    pub period_number: i64,
    pub period_status: Option<i64>,
    pub cutoff: Option<i64>,
    pub max_money_line: Option<f64>,
}
