//! Liveness and data-directory statistics.

use super::AppState;
use crate::fsutil;
use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

/// `GET /api/health`
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /api/stats`
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "tasks": state.orchestrator.task_count(),
        "credentials": state.credentials.count(),
        "archives": state.archives.count(),
        "pipes": state.pipes.count(),
        "data_size_bytes": fsutil::dir_size(&state.config.data_dir),
    }))
}
