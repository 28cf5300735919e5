use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// A whole poll cycle failed. The worker backs off and retries with the same cursor.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Network failure, timeout, non-2xx status, or a closed request gate.
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// The response body is not the feed shape at all.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// One upstream event that could not be parsed. Skipped; the rest of the batch goes on.
#[derive(Debug, Clone, Error)]
#[error("malformed event (event_id={event_id:?}): {reason}")]
pub struct MalformedEvent {
    pub event_id: Option<i64>,
    pub reason: String,
}

/// One event's write transaction failed and was rolled back.
#[derive(Debug, Error)]
#[error("persisting event {event_id} failed: {source}")]
pub struct PersistError {
    pub event_id: i64,
    #[source]
    pub source: sqlx::Error,
}
