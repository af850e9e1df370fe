//! Bearer-token negotiation against Docker Registry v2 auth challenges.
//!
//! Registries answer unauthenticated requests with a 401 carrying a
//! `WWW-Authenticate: Bearer realm="…",service="…"` challenge; the token
//! endpoint then trades basic credentials for a scoped bearer token.

use crate::credentials::RegistryAuth;
use crate::error::{AppError, Result};
use reqwest::Client;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("not a Bearer challenge")]
    NotBearer,
    #[error("challenge is missing realm or service")]
    Incomplete,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parse `Bearer realm="…",service="…",scope="…"`.
pub fn parse_challenge(header: &str) -> std::result::Result<AuthChallenge, ChallengeError> {
    let params = header
        .strip_prefix("Bearer ")
        .ok_or(ChallengeError::NotBearer)?;

    let mut realm = String::new();
    let mut service = String::new();
    let mut scope = None;
    for param in params.split(',') {
        let param = param.trim();
        if let Some(eq) = param.find('=') {
            let key = param[..eq].trim();
            let value = param[eq + 1..].trim().trim_matches('"');
            match key {
                "realm" => realm = value.to_string(),
                "service" => service = value.to_string(),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
        }
    }
    if realm.is_empty() || service.is_empty() {
        return Err(ChallengeError::Incomplete);
    }
    Ok(AuthChallenge {
        realm,
        service,
        scope,
    })
}

/// Request a token from the challenge's realm, preferring the explicit
/// `scope` over the one the challenge carried.
pub async fn fetch_token(
    client: &Client,
    challenge: &AuthChallenge,
    scope: Option<&str>,
    auth: Option<&RegistryAuth>,
) -> Result<String> {
    let mut url = format!("{}?service={}", challenge.realm, challenge.service);
    if let Some(scope) = scope.or(challenge.scope.as_deref()) {
        url.push_str(&format!("&scope={}", scope));
    }

    let mut request = client.get(&url);
    if let Some(auth) = auth {
        request = request.basic_auth(&auth.username, Some(&auth.password));
    }
    let response = request.send().await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Auth(format!(
            "token request failed with status {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )));
    }

    let token: TokenResponse = response.json().await?;
    token
        .token
        .or(token.access_token)
        .ok_or_else(|| AppError::Auth("no token in auth response".to_string()))
}

/// Probe `<base>/v2/` and, when challenged, trade credentials for a
/// bearer token scoped to `scope`. `Ok(None)` means the registry wants
/// no authentication (or accepts plain basic auth).
pub async fn negotiate(
    client: &Client,
    base_url: &str,
    auth: Option<&RegistryAuth>,
    scope: Option<&str>,
) -> Result<Option<String>> {
    let url = format!("{}/v2/", base_url);
    let response = client.get(&url).send().await?;

    if response.status().as_u16() == 401 {
        let header = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if header.starts_with("Bearer ") {
            let challenge = parse_challenge(&header)
                .map_err(|e| AppError::Auth(format!("invalid auth challenge: {}", e)))?;
            return Ok(Some(fetch_token(client, &challenge, scope, auth).await?));
        }
        // Basic-only registries: the caller attaches basic auth itself.
        if auth.is_none() {
            return Err(AppError::Auth(
                "registry requires authentication".to_string(),
            ));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_challenge() {
        let challenge = parse_challenge(
            r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:org/app:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.example.com/token");
        assert_eq!(challenge.service, "registry.example.com");
        assert_eq!(challenge.scope.as_deref(), Some("repository:org/app:pull"));
    }

    #[test]
    fn test_parse_challenge_rejects_basic() {
        assert!(matches!(
            parse_challenge(r#"Basic realm="registry""#),
            Err(ChallengeError::NotBearer)
        ));
    }

    #[test]
    fn test_parse_challenge_requires_realm_and_service() {
        assert!(matches!(
            parse_challenge(r#"Bearer scope="repository:a:pull""#),
            Err(ChallengeError::Incomplete)
        ));
    }
}
