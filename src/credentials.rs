//! Credential registry.
//!
//! Credentials live in `<data>/credentials.enc` as a base64-encoded JSON
//! list; at-rest encryption is the vault collaborator's concern. The API
//! surface never returns a real password: listings substitute the mask,
//! and updates that echo the mask back preserve the stored secret. A
//! masked or empty password can never reach a registry — [`CredentialStore::resolve_auth`]
//! gates it before any client is built.

use crate::error::{AppError, Result};
use crate::fsutil;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

/// What a stored password looks like from the outside.
pub const MASKED_PASSWORD: &str = "********";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub registry: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub created_at: String,
}

impl Credential {
    pub fn masked(&self) -> Credential {
        let mut c = self.clone();
        if !c.password.is_empty() {
            c.password = MASKED_PASSWORD.to_string();
        }
        c
    }
}

/// Registry credentials in the shape the copier and registry clients use.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryAuth {
    pub registry: String,
    pub username: String,
    pub password: String,
}

pub struct CredentialStore {
    path: PathBuf,
    inner: Mutex<Vec<Credential>>,
}

impl CredentialStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let creds = if path.exists() {
            let raw = std::fs::read(&path)?;
            let decoded = BASE64
                .decode(raw.trim_ascii())
                .map_err(|e| AppError::Parse(format!("credential vault is corrupt: {}", e)))?;
            serde_json::from_slice(&decoded)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            inner: Mutex::new(creds),
        })
    }

    fn persist(&self, creds: &[Credential]) -> Result<()> {
        let json = serde_json::to_vec_pretty(creds)?;
        let encoded = BASE64.encode(&json);
        fsutil::atomic_write(&self.path, encoded.as_bytes())
    }

    /// All credentials with passwords masked.
    pub fn list(&self) -> Vec<Credential> {
        let creds = self.inner.lock().expect("credential store poisoned");
        creds.iter().map(Credential::masked).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("credential store poisoned").len()
    }

    /// Raw credential, password included. Internal use only.
    pub fn get(&self, id: &str) -> Option<Credential> {
        let creds = self.inner.lock().expect("credential store poisoned");
        creds.iter().find(|c| c.id == id).cloned()
    }

    pub fn create(&self, mut cred: Credential) -> Result<Credential> {
        if cred.registry.trim().is_empty() {
            return Err(AppError::validation("registry is required"));
        }
        if cred.id.trim().is_empty() {
            cred.id = fsutil::make_id("cred");
        }
        fsutil::check_id(&cred.id)?;
        if cred.created_at.is_empty() {
            cred.created_at = fsutil::now_rfc3339_nanos();
        }
        let mut creds = self.inner.lock().expect("credential store poisoned");
        if creds.iter().any(|c| c.id == cred.id) {
            return Err(AppError::conflict(format!(
                "credential already exists: {}",
                cred.id
            )));
        }
        creds.push(cred.clone());
        self.persist(&creds)?;
        Ok(cred.masked())
    }

    /// Update a credential. A masked or empty incoming password keeps the
    /// stored one.
    pub fn update(&self, id: &str, incoming: Credential) -> Result<Credential> {
        let mut creds = self.inner.lock().expect("credential store poisoned");
        let cred = creds
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| AppError::not_found(format!("credential not found: {}", id)))?;
        if !incoming.registry.trim().is_empty() {
            cred.registry = incoming.registry.trim().to_string();
        }
        cred.name = incoming.name;
        cred.username = incoming.username;
        if !incoming.password.is_empty() && incoming.password != MASKED_PASSWORD {
            cred.password = incoming.password;
        }
        let updated = cred.masked();
        self.persist(&creds)?;
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut creds = self.inner.lock().expect("credential store poisoned");
        let before = creds.len();
        creds.retain(|c| c.id != id);
        if creds.len() == before {
            return Err(AppError::not_found(format!("credential not found: {}", id)));
        }
        self.persist(&creds)
    }

    /// Resolve a credential id into usable registry auth.
    ///
    /// An empty id means anonymous access (`None`). A credential whose
    /// password is empty or still masked is unusable and fails the
    /// auth gate.
    pub fn resolve_auth(&self, id: &str) -> Result<Option<RegistryAuth>> {
        if id.trim().is_empty() {
            return Ok(None);
        }
        let cred = self
            .get(id)
            .ok_or_else(|| AppError::validation(format!("credential not found: {}", id)))?;
        if cred.password.is_empty() || cred.password == MASKED_PASSWORD {
            return Err(AppError::AuthGate(format!(
                "credential {} has a masked or empty password and cannot be used",
                id
            )));
        }
        Ok(Some(RegistryAuth {
            registry: cred.registry,
            username: cred.username,
            password: cred.password,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("credentials.enc")).unwrap();
        (dir, store)
    }

    fn sample(id: &str, registry: &str) -> Credential {
        Credential {
            id: id.to_string(),
            name: "test".to_string(),
            registry: registry.to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
            created_at: String::new(),
        }
    }

    #[test]
    fn test_create_assigns_id_and_masks_password() {
        let (_dir, store) = store();
        let created = store.create(sample("", "ghcr.io")).unwrap();
        assert!(created.id.starts_with("cred_"));
        assert_eq!(created.password, MASKED_PASSWORD);
        // The raw store still holds the secret.
        assert_eq!(store.get(&created.id).unwrap().password, "secret");
    }

    #[test]
    fn test_update_preserves_password_on_mask() {
        let (_dir, store) = store();
        store.create(sample("cred_a", "ghcr.io")).unwrap();
        let mut incoming = sample("cred_a", "ghcr.io");
        incoming.password = MASKED_PASSWORD.to_string();
        store.update("cred_a", incoming).unwrap();
        assert_eq!(store.get("cred_a").unwrap().password, "secret");

        let mut incoming = sample("cred_a", "ghcr.io");
        incoming.password = "rotated".to_string();
        store.update("cred_a", incoming).unwrap();
        assert_eq!(store.get("cred_a").unwrap().password, "rotated");
    }

    #[test]
    fn test_resolve_auth_gates_masked_and_empty() {
        let (_dir, store) = store();
        let mut cred = sample("cred_a", "ghcr.io");
        cred.password = MASKED_PASSWORD.to_string();
        store.create(cred).unwrap();
        assert!(matches!(
            store.resolve_auth("cred_a"),
            Err(AppError::AuthGate(_))
        ));
        assert!(store.resolve_auth("").unwrap().is_none());
        assert!(store.resolve_auth("missing").is_err());
    }

    #[test]
    fn test_vault_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.enc");
        {
            let store = CredentialStore::open(path.clone()).unwrap();
            store.create(sample("cred_a", "ghcr.io")).unwrap();
        }
        let store = CredentialStore::open(path.clone()).unwrap();
        assert_eq!(store.get("cred_a").unwrap().password, "secret");
        // The vault file itself is not plain JSON.
        let raw = std::fs::read(&path).unwrap();
        assert_ne!(raw.first(), Some(&b'['));
    }
}
