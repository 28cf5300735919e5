use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::api::health::{SweepStatus, StatusRegistry, WorkerStatus};
use crate::db::Store;
use crate::error::AppError;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub status: Arc<StatusRegistry>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(state)
}

#[derive(Serialize)]
pub struct SportHealth {
    pub sport_id: i64,
    #[serde(flatten)]
    pub status: WorkerStatus,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub workers: Vec<SportHealth>,
    pub last_sweep: Option<SweepStatus>,
    /// Live table row counts.
    pub tables: Vec<TableCount>,
}

#[derive(Serialize)]
pub struct TableCount {
    pub table: &'static str,
    pub rows: i64,
}

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let tables = state
        .store
        .table_counts()
        .await?
        .into_iter()
        .map(|(table, rows)| TableCount { table, rows })
        .collect();

    let workers = state
        .status
        .workers()
        .into_iter()
        .map(|(sport_id, status)| SportHealth { sport_id, status })
        .collect();

    Ok(Json(HealthResponse {
        workers,
        last_sweep: state.status.last_sweep(),
        tables,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::memory_store;
    use crate::ingest::WorkerState;

    #[tokio::test]
    async fn health_reports_workers_and_tables() {
        let status = Arc::new(StatusRegistry::new());
        status.set_state(29, WorkerState::Persisting);
        let state = ApiState { store: memory_store().await, status };

        let Json(health) = get_health(State(state)).await.unwrap();
        assert_eq!(health.workers.len(), 1);
        assert_eq!(health.workers[0].sport_id, 29);
        assert_eq!(health.tables.len(), 6);

        let body = serde_json::to_value(&health).unwrap();
        assert_eq!(body["workers"][0]["state"], "persisting");
        assert!(body["last_sweep"].is_null());
    }
}
