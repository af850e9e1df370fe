//! Registry query client: catalog and tag listings plus the credential
//! probe behind the verify endpoint.
//!
//! Failures carry the upstream HTTP status and a trimmed error detail
//! parsed from the registry's `{errors:[{code,message}]}` body so the
//! API layer can surface both.

use crate::credentials::RegistryAuth;
use crate::error::{AppError, Result};
use crate::refs;
use crate::registry::auth;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

/// Longest upstream detail retained in error envelopes.
const MAX_DETAIL_CHARS: usize = 900;

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TagListResponse {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RegistryErrorBody {
    #[serde(default)]
    errors: Vec<RegistryErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistryErrorEntry {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

pub struct RegistryClient {
    client: Client,
    base_url: String,
    auth: Option<RegistryAuth>,
}

impl RegistryClient {
    pub fn new(registry: &str, auth: Option<RegistryAuth>) -> Result<Self> {
        let host = refs::registry_host(registry);
        if host.is_empty() {
            return Err(AppError::validation("registry is required"));
        }
        let client = Client::builder()
            .build()
            .map_err(|e| AppError::internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: refs::registry_base_url(&host),
            auth,
        })
    }

    fn apply_auth(&self, request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        if let Some(token) = token {
            request.bearer_auth(token)
        } else if let Some(auth) = &self.auth {
            request.basic_auth(&auth.username, Some(&auth.password))
        } else {
            request
        }
    }

    /// Verify the credentials against `/v2/`.
    pub async fn probe(&self) -> Result<()> {
        let token =
            auth::negotiate(&self.client, &self.base_url, self.auth.as_ref(), None).await?;
        let url = format!("{}/v2/", self.base_url);
        let response = self
            .apply_auth(self.client.get(&url), token.as_deref())
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AppError::Auth(
                "registry rejected the credentials".to_string(),
            )),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(upstream_error(status.as_u16(), &body))
            }
        }
    }

    /// List repositories via `/v2/_catalog`, optionally filtered to a
    /// namespace prefix.
    pub async fn list_repositories(&self, namespace: Option<&str>) -> Result<Vec<String>> {
        let scope = "registry:catalog:*";
        let token =
            auth::negotiate(&self.client, &self.base_url, self.auth.as_ref(), Some(scope)).await?;
        let url = format!("{}/v2/_catalog?n=1000", self.base_url);
        let response = self
            .apply_auth(self.client.get(&url), token.as_deref())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(upstream_error(status, &body));
        }

        let catalog: CatalogResponse = response.json().await?;
        let mut repositories = catalog.repositories;
        if let Some(ns) = namespace.map(str::trim).filter(|ns| !ns.is_empty()) {
            let prefix = format!("{}/", ns);
            repositories.retain(|r| r.starts_with(&prefix) || r == ns);
        }
        Ok(repositories)
    }

    /// List tags of one repository via `/v2/<repo>/tags/list`.
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let repository = repository.trim();
        if repository.is_empty() {
            return Err(AppError::validation("repo is required"));
        }
        let scope = format!("repository:{}:pull", repository);
        let token = auth::negotiate(
            &self.client,
            &self.base_url,
            self.auth.as_ref(),
            Some(&scope),
        )
        .await?;
        let url = format!("{}/v2/{}/tags/list", self.base_url, repository);
        let response = self
            .apply_auth(self.client.get(&url), token.as_deref())
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                let tags: TagListResponse = response.json().await?;
                Ok(tags.tags.unwrap_or_default())
            }
            StatusCode::NOT_FOUND => Err(AppError::not_found(format!(
                "repository not found: {}",
                repository
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(upstream_error(status.as_u16(), &body))
            }
        }
    }
}

/// Build an upstream error with the registry's own message trimmed into
/// a single-line detail.
pub fn upstream_error(status: u16, body: &str) -> AppError {
    let detail = parse_error_detail(body);
    AppError::Upstream {
        status: Some(status),
        message: format!("registry request failed with status {}", status),
        detail,
    }
}

fn parse_error_detail(body: &str) -> Option<String> {
    let raw = match serde_json::from_str::<RegistryErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .iter()
            .map(|e| {
                if e.code.is_empty() {
                    e.message.clone()
                } else {
                    format!("{}: {}", e.code, e.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.to_string(),
    };
    let single_line = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.is_empty() {
        None
    } else {
        Some(single_line.chars().take(MAX_DETAIL_CHARS).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_detail_from_registry_body() {
        let body = r#"{"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}"#;
        assert_eq!(
            parse_error_detail(body).as_deref(),
            Some("UNAUTHORIZED: authentication required")
        );
    }

    #[test]
    fn test_parse_error_detail_falls_back_to_raw_body() {
        assert_eq!(
            parse_error_detail("plain\nerror   text").as_deref(),
            Some("plain error text")
        );
        assert!(parse_error_detail("").is_none());
    }

    #[test]
    fn test_parse_error_detail_is_trimmed() {
        let body = "x".repeat(2000);
        assert_eq!(parse_error_detail(&body).unwrap().len(), MAX_DETAIL_CHARS);
    }

    #[test]
    fn test_client_requires_registry() {
        assert!(RegistryClient::new("", None).is_err());
        assert!(RegistryClient::new("ghcr.io", None).is_ok());
    }
}
