//! Pipe document endpoints.

use super::AppState;
use crate::error::AppError;
use crate::pipes::{Pipe, PipeBody, PipeOp, PipeVersionInfo, UpdateOptions};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Default, Deserialize)]
pub struct UpdateQuery {
    #[serde(default)]
    pub autosave: Option<String>,
    #[serde(default)]
    pub force: Option<String>,
    #[serde(default)]
    pub base_updated_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some("1") | Some("true") | Some("yes"))
}

/// `GET /api/pipes`
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Pipe>>, AppError> {
    Ok(Json(state.pipes.list()?))
}

/// `POST /api/pipes`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<PipeBody>,
) -> Result<(StatusCode, Json<Pipe>), AppError> {
    let pipe = state.pipes.create(body)?;
    Ok((StatusCode::CREATED, Json(pipe)))
}

/// `GET /api/pipes/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Pipe>, AppError> {
    Ok(Json(state.pipes.get(&id)?))
}

/// `PUT /api/pipes/{id}?autosave=&force=&base_updated_at=`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<UpdateQuery>,
    Json(body): Json<PipeBody>,
) -> Result<Json<Pipe>, AppError> {
    let options = UpdateOptions {
        autosave: flag(&query.autosave),
        force: flag(&query.force),
        base_updated_at: query.base_updated_at,
    };
    Ok(Json(state.pipes.update(&id, body, &options)?))
}

/// `DELETE /api/pipes/{id}`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.pipes.delete(&id)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// `GET /api/pipes/{id}/versions`
pub async fn versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<PipeVersionInfo>>, AppError> {
    Ok(Json(state.pipes.list_versions(&id)?))
}

/// `GET /api/pipes/{id}/versions/{version}`
pub async fn version(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, i64)>,
) -> Result<Json<Pipe>, AppError> {
    Ok(Json(state.pipes.get_version(&id, version)?))
}

/// `GET /api/pipes/{id}/ops?limit=`
pub async fn ops(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OpsQuery>,
) -> Result<Json<Vec<PipeOp>>, AppError> {
    Ok(Json(state.pipes.list_ops(&id, query.limit)?))
}

/// `POST /api/pipes/{id}/ops`
pub async fn append_ops(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(ops): Json<Vec<PipeOp>>,
) -> Result<Json<Value>, AppError> {
    let appended = state.pipes.append_ops(&id, ops)?;
    Ok(Json(json!({ "appended": appended })))
}
