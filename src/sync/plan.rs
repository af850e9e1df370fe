//! Request intake: validation, normalization, dedup and defaults.
//!
//! Planning happens entirely before any worker starts, so a request that
//! fails here leaves no trace. The output is a [`SyncPlan`]: the initial
//! persisted [`Task`] plus the resolved registry auth the workers will
//! hand to their Copiers.

use crate::credentials::{CredentialStore, RegistryAuth};
use crate::error::{AppError, Result};
use crate::fsutil;
use crate::refs;
use crate::sync::task::{SyncStatus, TargetState, Task, TaskMode, log_line};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default, alias = "ref")]
    pub target_ref: String,
    #[serde(default, alias = "id")]
    pub target_id: String,
}

/// A sync request as accepted from the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub source_ref: String,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub target_ref: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub fail_fast: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Planning output: the task to persist plus per-target auth, index-
/// aligned with `task.targets`.
pub struct SyncPlan {
    pub task: Task,
    pub source_auth: Option<RegistryAuth>,
    pub target_auths: Vec<Option<RegistryAuth>>,
}

pub fn plan_task(req: &SyncRequest, credentials: &CredentialStore) -> Result<SyncPlan> {
    let source_ref = req.source_ref.trim();
    if source_ref.is_empty() {
        return Err(AppError::validation("source_ref is required"));
    }

    // The single-target convenience fields collapse into a one-element
    // target list when no explicit list was given.
    let targets_input: Vec<TargetSpec> = if req.targets.is_empty() {
        if req.target_ref.trim().is_empty() {
            Vec::new()
        } else {
            vec![TargetSpec {
                target_ref: req.target_ref.clone(),
                target_id: req.target_id.clone(),
            }]
        }
    } else {
        req.targets.clone()
    };
    if targets_input.is_empty() {
        return Err(AppError::validation("at least one target is required"));
    }

    let source_id = req.source_id.trim().to_string();
    let source_auth = credentials.resolve_auth(&source_id)?;

    let mut log_lines = Vec::new();

    let source_registry = source_auth
        .as_ref()
        .map(|a| a.registry.as_str())
        .unwrap_or("");
    let normalized_source = refs::normalize_ref(source_ref, source_registry);
    if normalized_source != source_ref {
        log_lines.push(log_line(
            "INFO",
            &format!("normalized source ref {} -> {}", source_ref, normalized_source),
        ));
    }

    // Normalize every target against its own credential's registry, then
    // keep the first occurrence per normalized ref.
    let mut seen = HashSet::new();
    let mut planned: Vec<(String, String, Option<RegistryAuth>)> = Vec::new();
    for spec in &targets_input {
        let raw = spec.target_ref.trim();
        if raw.is_empty() {
            continue;
        }
        let target_id = spec.target_id.trim().to_string();
        let auth = credentials.resolve_auth(&target_id)?;
        let registry = auth.as_ref().map(|a| a.registry.as_str()).unwrap_or("");
        let normalized = refs::normalize_ref(raw, registry);
        if normalized != raw {
            log_lines.push(log_line(
                "INFO",
                &format!("normalized target ref {} -> {}", raw, normalized),
            ));
        }
        if seen.insert(normalized.clone()) {
            planned.push((normalized, target_id, auth));
        }
    }
    if planned.is_empty() {
        return Err(AppError::validation("at least one target is required"));
    }

    let n = planned.len();
    let concurrency = match req.concurrency {
        Some(c) if c > 0 => c.min(n),
        _ => 2.min(n),
    };
    let max_retries = req.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
    let fail_fast = req.fail_fast.unwrap_or(n == 1);
    let timeout_seconds = match req.timeout_seconds {
        Some(t) if t > 0 => t,
        _ => DEFAULT_TIMEOUT_SECONDS,
    };

    let (target_ref, target_id) = if n == 1 {
        (planned[0].0.clone(), planned[0].1.clone())
    } else {
        (String::new(), String::new())
    };

    let mut task = Task {
        id: fsutil::make_id("task"),
        mode: if n == 1 {
            TaskMode::Single
        } else {
            TaskMode::Batch
        },
        source_ref: normalized_source,
        source_id,
        target_ref,
        target_id,
        targets: planned
            .iter()
            .map(|(r, id, _)| TargetState::new(r.clone(), id.clone()))
            .collect(),
        status: SyncStatus::Running,
        fail_fast,
        max_retries,
        concurrency,
        timeout_seconds,
        cancel_requested: false,
        error_summary: String::new(),
        created_at: Utc::now(),
        ended_at: None,
        logs: Vec::new(),
    };
    for line in log_lines {
        task.push_log(line);
    }
    task.push_log(log_line(
        "INFO",
        &format!("sync task planned with {} target(s)", n),
    ));

    Ok(SyncPlan {
        source_auth,
        target_auths: planned.into_iter().map(|(_, _, auth)| auth).collect(),
        task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;

    fn credentials_with(entries: &[(&str, &str)]) -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("credentials.enc")).unwrap();
        for (id, registry) in entries {
            store
                .create(Credential {
                    id: id.to_string(),
                    name: id.to_string(),
                    registry: registry.to_string(),
                    username: "user".to_string(),
                    password: "secret".to_string(),
                    created_at: String::new(),
                })
                .unwrap();
        }
        (dir, store)
    }

    fn request(targets: &[&str]) -> SyncRequest {
        SyncRequest {
            source_ref: "src:latest".to_string(),
            targets: targets
                .iter()
                .map(|r| TargetSpec {
                    target_ref: r.to_string(),
                    target_id: String::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_for_two_targets() {
        let (_dir, creds) = credentials_with(&[]);
        let plan = plan_task(&request(&["dst-a:latest", "dst-b:latest"]), &creds).unwrap();
        let task = plan.task;
        assert_eq!(task.mode, TaskMode::Batch);
        assert_eq!(task.concurrency, 2);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert!(!task.fail_fast);
        assert_eq!(task.status, SyncStatus::Running);
        assert!(task.targets.iter().all(|t| t.status == SyncStatus::Pending));
    }

    #[test]
    fn test_single_target_defaults_and_denormalized_fields() {
        let (_dir, creds) = credentials_with(&[]);
        let mut req = SyncRequest {
            source_ref: "src:latest".to_string(),
            target_ref: "dst:latest".to_string(),
            ..Default::default()
        };
        req.target_id = String::new();
        let task = plan_task(&req, &creds).unwrap().task;
        assert_eq!(task.mode, TaskMode::Single);
        assert!(task.fail_fast);
        assert_eq!(task.concurrency, 1);
        assert_eq!(task.target_ref, "dst:latest");
    }

    #[test]
    fn test_overrides_and_concurrency_cap() {
        let (_dir, creds) = credentials_with(&[]);
        let mut req = request(&["dst-a:latest", "dst-b:latest"]);
        req.concurrency = Some(8);
        req.max_retries = Some(0);
        req.fail_fast = Some(true);
        req.timeout_seconds = Some(1);
        let task = plan_task(&req, &creds).unwrap().task;
        assert_eq!(task.concurrency, 2); // capped at target count
        assert_eq!(task.max_retries, 0);
        assert!(task.fail_fast);
        assert_eq!(task.timeout_seconds, 1);
    }

    #[test]
    fn test_invalid_overrides_fall_back_to_defaults() {
        let (_dir, creds) = credentials_with(&[]);
        let mut req = request(&["dst-a:latest", "dst-b:latest"]);
        req.concurrency = Some(0);
        req.timeout_seconds = Some(0);
        let task = plan_task(&req, &creds).unwrap().task;
        assert_eq!(task.concurrency, 2);
        assert_eq!(task.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
    }

    #[test]
    fn test_normalization_per_target_credential() {
        let (_dir, creds) = credentials_with(&[
            ("cred-src", "docker.io"),
            ("cred-aliyun", "registry.cn-hangzhou.aliyuncs.com"),
            ("cred-ghcr", "ghcr.io"),
        ]);
        let req = SyncRequest {
            source_ref: "kwdb/smart-meter".to_string(),
            source_id: "cred-src".to_string(),
            targets: vec![
                TargetSpec {
                    target_ref: "kwdb/smart-meter".to_string(),
                    target_id: "cred-aliyun".to_string(),
                },
                TargetSpec {
                    target_ref: "kwdb/smart-meter".to_string(),
                    target_id: "cred-ghcr".to_string(),
                },
            ],
            ..Default::default()
        };
        let task = plan_task(&req, &creds).unwrap().task;
        // The Hub-backed source stays unprefixed, the targets pick up
        // their registry hosts and so no longer collide.
        assert_eq!(task.source_ref, "kwdb/smart-meter");
        assert_eq!(
            task.targets[0].target_ref,
            "registry.cn-hangzhou.aliyuncs.com/kwdb/smart-meter"
        );
        assert_eq!(task.targets[1].target_ref, "ghcr.io/kwdb/smart-meter");
        assert_eq!(task.targets.len(), 2);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence_and_drops_empty() {
        let (_dir, creds) = credentials_with(&[]);
        let req = request(&["dst-a:latest", "", "dst-a:latest", "dst-b:latest"]);
        let task = plan_task(&req, &creds).unwrap().task;
        let refs: Vec<_> = task.targets.iter().map(|t| t.target_ref.as_str()).collect();
        assert_eq!(refs, vec!["dst-a:latest", "dst-b:latest"]);
    }

    #[test]
    fn test_missing_source_or_targets_is_bad_request() {
        let (_dir, creds) = credentials_with(&[]);
        let mut req = request(&["dst:latest"]);
        req.source_ref = "  ".to_string();
        assert!(matches!(
            plan_task(&req, &creds),
            Err(AppError::Validation(_))
        ));

        let req = SyncRequest {
            source_ref: "src:latest".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            plan_task(&req, &creds),
            Err(AppError::Validation(_))
        ));
    }
}
