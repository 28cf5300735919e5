use std::time::Duration;

use crate::error::{AppError, Result};

pub const PINNACLE_API_URL: &str = "https://pinnacle-odds.p.rapidapi.com/kit/v1/markets";
pub const PINNACLE_API_SPORTS_URL: &str = "https://pinnacle-odds.p.rapidapi.com/kit/v1/sports";
pub const PINNACLE_API_HOST: &str = "pinnacle-odds.p.rapidapi.com";

/// Upper bound on upstream requests in flight across all sport workers.
pub const MAX_CONCURRENT_REQUESTS: usize = 3;

/// Per-sport request rate: 5 requests/second → 200ms spacing.
pub const REQUEST_SPACING_MS: u64 = 200;

/// Delay between polls after a batch (or an empty batch).
pub const POLL_DELAY_MS: u64 = 1_000;

/// Fixed delay spent in BACKOFF after a failed cycle.
pub const BACKOFF_SECS: u64 = 5;

/// Upstream calls that take longer than this count as fetch failures.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Delay before a supervised sport worker is respawned after it ended.
pub const WORKER_RESTART_SECS: u64 = 10;

/// Retry delay while discovering sport ids at startup.
pub const SPORTS_RETRY_SECS: u64 = 30;

/// Archive sweep cadence (minutes). Retention defaults to the same value.
pub const ARCHIVE_INTERVAL_MINUTES: u64 = 10;

/// Capacity of the odds-update broadcast channel.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub sports_url: String,
    pub api_host: String,
    pub api_key: String,
    /// Sports to poll (SPORT_IDS, comma-separated). Empty → discover from the sports endpoint.
    pub sport_ids: Vec<i64>,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub max_concurrent_requests: usize,
    pub request_spacing: Duration,
    pub poll_delay: Duration,
    pub backoff: Duration,
    pub request_timeout: Duration,
    pub archive_interval: Duration,
    /// Events starting earlier than now minus this are archived (ARCHIVE_RETENTION_MINUTES).
    pub archive_retention: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_url = url_var("PINNACLE_API_URL", PINNACLE_API_URL)?;
        let sports_url = url_var("PINNACLE_API_SPORTS_URL", PINNACLE_API_SPORTS_URL)?;

        let api_key = std::env::var("PINNACLE_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(AppError::Config("PINNACLE_API_KEY must be set".to_string()));
        }

        let sport_ids = parse_sport_ids(&std::env::var("SPORT_IDS").unwrap_or_default())?;

        let max_concurrent_requests: usize =
            parsed_var("MAX_CONCURRENT_REQUESTS", MAX_CONCURRENT_REQUESTS)?;
        if max_concurrent_requests == 0 {
            return Err(AppError::Config(
                "MAX_CONCURRENT_REQUESTS must be at least 1".to_string(),
            ));
        }

        let archive_minutes: u64 = parsed_var("ARCHIVE_INTERVAL_MINUTES", ARCHIVE_INTERVAL_MINUTES)?;
        let retention_minutes: u64 = parsed_var("ARCHIVE_RETENTION_MINUTES", archive_minutes)?;
        if archive_minutes == 0 {
            return Err(AppError::Config(
                "ARCHIVE_INTERVAL_MINUTES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            api_url,
            sports_url,
            api_host: std::env::var("PINNACLE_API_HOST")
                .unwrap_or_else(|_| PINNACLE_API_HOST.to_string()),
            api_key,
            sport_ids,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "odds.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            max_concurrent_requests,
            request_spacing: Duration::from_millis(parsed_var("REQUEST_SPACING_MS", REQUEST_SPACING_MS)?),
            poll_delay: Duration::from_millis(parsed_var("POLL_DELAY_MS", POLL_DELAY_MS)?),
            backoff: Duration::from_secs(parsed_var("BACKOFF_SECS", BACKOFF_SECS)?),
            request_timeout: Duration::from_secs(parsed_var("REQUEST_TIMEOUT_SECS", REQUEST_TIMEOUT_SECS)?),
            archive_interval: minutes("ARCHIVE_INTERVAL_MINUTES", archive_minutes)?,
            archive_retention: minutes("ARCHIVE_RETENTION_MINUTES", retention_minutes)?,
        })
    }
}

#[cfg(test)]
impl Config {
    /// Defaults pointed at a local upstream.
    pub(crate) fn local(base_url: &str) -> Self {
        Self {
            api_url: format!("{base_url}/markets"),
            sports_url: format!("{base_url}/sports"),
            api_host: PINNACLE_API_HOST.to_string(),
            api_key: "test-key".to_string(),
            sport_ids: vec![1],
            log_level: "debug".to_string(),
            db_path: ":memory:".to_string(),
            api_port: 0,
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
            request_spacing: Duration::from_millis(10),
            poll_delay: Duration::from_millis(10),
            backoff: Duration::from_millis(50),
            request_timeout: Duration::from_secs(5),
            archive_interval: Duration::from_secs(ARCHIVE_INTERVAL_MINUTES * 60),
            archive_retention: Duration::from_secs(ARCHIVE_INTERVAL_MINUTES * 60),
        }
    }
}

/// Reads `name`, falling back to `default` when unset. A set-but-unparseable value is an error.
fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name} has an invalid value: {raw:?}"))),
        _ => Ok(default),
    }
}

fn minutes(name: &str, value: u64) -> Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| AppError::Config(format!("{name} is too large: {value}")))
}

fn url_var(name: &str, default: &str) -> Result<String> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    reqwest::Url::parse(&raw)
        .map_err(|e| AppError::Config(format!("{name} is not a valid URL ({raw}): {e}")))?;
    Ok(raw)
}

pub fn parse_sport_ids(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| AppError::Config(format!("SPORT_IDS contains a non-integer id: {s:?}")))
        })
        .collect()
}
