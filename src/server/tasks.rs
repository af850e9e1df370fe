//! Sync task endpoints.

use super::AppState;
use crate::error::AppError;
use crate::sync::RetryRequest;
use crate::sync::plan::SyncRequest;
use crate::sync::task::Task;
use axum::Json;
use axum::extract::{Path, State};

/// `POST /api/tasks/sync` — plan and start a task, returning the
/// initial snapshot.
pub async fn execute_sync(
    State(state): State<AppState>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.orchestrator.execute_sync(request).await?))
}

/// `GET /api/tasks` — newest first, without logs.
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Task>>, AppError> {
    Ok(Json(state.orchestrator.list_tasks()?))
}

/// `GET /api/tasks/{id}` — full task including logs.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.orchestrator.get_task(&id)?))
}

/// `POST /api/tasks/{id}/cancel`
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    Ok(Json(state.orchestrator.cancel(&id).await?))
}

/// `POST /api/tasks/{id}/retry` — the body is optional; an empty body
/// retries failed targets with the original knobs.
pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<Task>, AppError> {
    let request: RetryRequest = if body.is_empty() {
        RetryRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::validation(format!("invalid retry body: {}", e)))?
    };
    Ok(Json(state.orchestrator.retry(&id, &request).await?))
}
