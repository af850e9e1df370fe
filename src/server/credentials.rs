//! Credential endpoints. Responses always carry masked passwords.

use super::AppState;
use crate::credentials::Credential;
use crate::error::AppError;
use crate::registry::client::RegistryClient;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

/// `GET /api/credentials`
pub async fn list(State(state): State<AppState>) -> Json<Vec<Credential>> {
    Json(state.credentials.list())
}

/// `POST /api/credentials`
pub async fn create(
    State(state): State<AppState>,
    Json(credential): Json<Credential>,
) -> Result<(StatusCode, Json<Credential>), AppError> {
    let created = state.credentials.create(credential)?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `PUT /api/credentials/{id}`
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(credential): Json<Credential>,
) -> Result<Json<Credential>, AppError> {
    let updated = state.credentials.update(&id, credential)?;
    state.queries.invalidate_credential(&id);
    Ok(Json(updated))
}

/// `DELETE /api/credentials/{id}`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.credentials.delete(&id)?;
    state.queries.invalidate_credential(&id);
    Ok(Json(json!({ "status": "ok" })))
}

/// `POST /api/credentials/{id}/verify` — probe the registry with the
/// stored credentials.
pub async fn verify(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let auth = state
        .credentials
        .resolve_auth(&id)?
        .ok_or_else(|| AppError::validation("credential id is required"))?;
    let client = RegistryClient::new(&auth.registry, Some(auth.clone()))?;
    client.probe().await?;
    Ok(Json(json!({ "status": "ok" })))
}
