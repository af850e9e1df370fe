//! Registry query endpoints, backed by the TTL query cache.

use super::AppState;
use crate::error::AppError;
use crate::registry::cache::QueryCache;
use crate::registry::client::RegistryClient;
use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Default, Deserialize)]
pub struct RepositoriesQuery {
    #[serde(default)]
    pub cred_id: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TagsQuery {
    #[serde(default)]
    pub cred_id: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub repo: String,
}

fn effective_registry(explicit: &str, auth_registry: Option<&str>) -> Result<String, AppError> {
    let registry = if explicit.trim().is_empty() {
        auth_registry.unwrap_or("").to_string()
    } else {
        explicit.trim().to_string()
    };
    if registry.is_empty() {
        return Err(AppError::validation("registry is required"));
    }
    Ok(registry)
}

/// `GET /api/registry/repositories?cred_id=&registry=&namespace=`
pub async fn repositories(
    State(state): State<AppState>,
    Query(query): Query<RepositoriesQuery>,
) -> Result<Json<Value>, AppError> {
    let auth = state.credentials.resolve_auth(&query.cred_id)?;
    let registry = effective_registry(&query.registry, auth.as_ref().map(|a| a.registry.as_str()))?;

    let key = QueryCache::key("repositories", &registry, &query.cred_id, &query.namespace);
    if let Some(hit) = state.queries.get(&key) {
        return Ok(Json(json!({ "repositories": hit })));
    }

    let client = RegistryClient::new(&registry, auth)?;
    let namespace = query.namespace.trim();
    let repositories = client
        .list_repositories(if namespace.is_empty() {
            None
        } else {
            Some(namespace)
        })
        .await?;
    state.queries.put(key, repositories.clone());
    Ok(Json(json!({ "repositories": repositories })))
}

/// `GET /api/registry/tags?cred_id=&repo=&registry=`
pub async fn tags(
    State(state): State<AppState>,
    Query(query): Query<TagsQuery>,
) -> Result<Json<Value>, AppError> {
    let auth = state.credentials.resolve_auth(&query.cred_id)?;
    let registry = effective_registry(&query.registry, auth.as_ref().map(|a| a.registry.as_str()))?;

    let key = QueryCache::key("tags", &registry, &query.cred_id, &query.repo);
    if let Some(hit) = state.queries.get(&key) {
        return Ok(Json(json!({ "tags": hit })));
    }

    let client = RegistryClient::new(&registry, auth)?;
    let tags = client.list_tags(&query.repo).await?;
    state.queries.put(key, tags.clone());
    Ok(Json(json!({ "tags": tags })))
}
