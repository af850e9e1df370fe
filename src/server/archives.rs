//! Archive endpoints: multipart upload, merge, list, delete.

use super::AppState;
use crate::archive::ArchiveMeta;
use crate::error::AppError;
use axum::Json;
use axum::extract::{Multipart, Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

/// `POST /api/archives` — multipart upload; each file becomes one
/// archive.
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Vec<ArchiveMeta>>, AppError> {
    let mut stored = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("invalid multipart body: {}", e)))?
    {
        let name = field
            .file_name()
            .map(str::to_string)
            .or_else(|| field.name().map(str::to_string))
            .unwrap_or_else(|| "upload.tar".to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::validation(format!("failed to read upload: {}", e)))?;

        // Rewriting a tarball into a layout is pure file I/O.
        let archives = state.archives.clone();
        let meta = tokio::task::spawn_blocking(move || archives.store_upload(&name, &data))
            .await
            .map_err(|e| AppError::internal(format!("upload worker failed: {}", e)))??;
        stored.push(meta);
    }
    if stored.is_empty() {
        return Err(AppError::validation("no files in upload"));
    }
    Ok(Json(stored))
}

/// `POST /api/archives/merge`
pub async fn merge(
    State(state): State<AppState>,
    Json(request): Json<MergeRequest>,
) -> Result<Json<ArchiveMeta>, AppError> {
    let archives = state.archives.clone();
    let meta = tokio::task::spawn_blocking(move || {
        archives.merge(&request.ids, request.name, request.tag)
    })
    .await
    .map_err(|e| AppError::internal(format!("merge worker failed: {}", e)))??;
    Ok(Json(meta))
}

/// `GET /api/archives`
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<ArchiveMeta>>, AppError> {
    Ok(Json(state.archives.list()?))
}

/// `DELETE /api/archives/{id}`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.archives.delete(&id)?;
    Ok(Json(json!({ "status": "ok" })))
}
