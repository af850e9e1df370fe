//! Task and target state, plus the durable task store.
//!
//! The persisted JSON under `<data>/tasks/` is the authoritative record
//! of every sync. Older deployments wrote camelCase keys, a `completed`
//! status and free-form logs; [`TaskStore::load`] accepts those shapes
//! and rewrites the file in canonical form on the next read, so the rest
//! of the codebase only ever sees the current schema.

use crate::error::{AppError, Result};
use crate::fsutil;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// Upper bound on retained per-task log lines; oldest drop first.
pub const MAX_TASK_LOGS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl SyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SyncStatus::Success | SyncStatus::Failed | SyncStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Single,
    Batch,
}

/// Per-target execution state inside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    pub target_ref: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl TargetState {
    pub fn new(target_ref: String, target_id: String) -> Self {
        Self {
            target_ref,
            target_id,
            status: SyncStatus::Pending,
            progress: 0.0,
            attempts: 0,
            error: String::new(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// One sync request, in flight or completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub mode: TaskMode,
    pub source_ref: String,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub target_ref: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(default)]
    pub targets: Vec<TargetState>,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub error_summary: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
}

fn default_concurrency() -> usize {
    1
}

fn default_timeout() -> u64 {
    3600
}

impl Task {
    /// Append a log line, dropping the oldest beyond the bound.
    pub fn push_log(&mut self, line: String) {
        if self.logs.len() >= MAX_TASK_LOGS {
            self.logs.remove(0);
        }
        self.logs.push(line);
    }

    /// Terminal status priority rule: any failed target makes the task
    /// failed; otherwise any canceled target or a pending cancel makes it
    /// canceled; otherwise it succeeded.
    pub fn terminal_status(&self) -> SyncStatus {
        if self.targets.iter().any(|t| t.status == SyncStatus::Failed) {
            SyncStatus::Failed
        } else if self.cancel_requested
            || self.targets.iter().any(|t| t.status == SyncStatus::Canceled)
        {
            SyncStatus::Canceled
        } else {
            SyncStatus::Success
        }
    }

    /// `"<ref>: <msg>"` joined by `"; "` over failed targets.
    pub fn compose_error_summary(&self) -> String {
        self.targets
            .iter()
            .filter(|t| t.status == SyncStatus::Failed)
            .map(|t| {
                if t.error.is_empty() {
                    format!("{}: failed", t.target_ref)
                } else {
                    format!("{}: {}", t.target_ref, t.error)
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Format one task log line as persisted and broadcast.
pub fn log_line(level: &str, message: &str) -> String {
    format!(
        "{} [{}] {}",
        Local::now().format("%H:%M:%S"),
        level.to_uppercase(),
        message
    )
}

/// Durable task storage: one JSON file per task.
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn open(dir: PathBuf) -> Result<Self> {
        crate::config::ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn save(&self, task: &Task) -> Result<()> {
        fsutil::atomic_write_json(&self.path(&task.id), task)
    }

    /// Load a task, upgrading legacy on-disk shapes to canonical form.
    /// When anything was converted the file is rewritten so the canonical
    /// shape becomes the stored one.
    pub fn load(&self, id: &str) -> Result<Task> {
        fsutil::check_id(id)?;
        let path = self.path(id);
        if !path.exists() {
            return Err(AppError::not_found(format!("task not found: {}", id)));
        }
        let mut value: Value = fsutil::read_json(&path)?;
        let converted = compat::canonicalize(&mut value);
        let task: Task = serde_json::from_value(value)
            .map_err(|e| AppError::Parse(format!("task file {} is corrupt: {}", id, e)))?;
        if converted {
            self.save(&task)?;
        }
        Ok(task)
    }

    /// All tasks, newest first, without logs.
    pub fn list(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            match self.load(stem) {
                Ok(mut task) => {
                    task.logs.clear();
                    tasks.push(task);
                }
                Err(err) => {
                    tracing::warn!(file = %name, "skipping unreadable task file: {}", err);
                }
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    pub fn count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".json"))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Legacy task-file canonicalization.
mod compat {
    use serde_json::{Map, Value};

    const KEY_ALIASES: &[(&str, &str)] = &[
        ("sourceRef", "source_ref"),
        ("sourceId", "source_id"),
        ("targetRef", "target_ref"),
        ("targetId", "target_id"),
        ("createdAt", "created_at"),
        ("endedAt", "ended_at"),
        ("startedAt", "started_at"),
        ("failFast", "fail_fast"),
        ("maxRetries", "max_retries"),
        ("timeoutSeconds", "timeout_seconds"),
        ("cancelRequested", "cancel_requested"),
        ("errorSummary", "error_summary"),
    ];

    fn canonicalize_keys(obj: &mut Map<String, Value>) -> bool {
        let mut changed = false;
        for (old, new) in KEY_ALIASES {
            if let Some(v) = obj.remove(*old) {
                obj.entry(new.to_string()).or_insert(v);
                changed = true;
            }
        }
        if let Some(Value::String(status)) = obj.get("status") {
            if status == "completed" {
                obj.insert("status".to_string(), Value::String("success".to_string()));
                changed = true;
            }
        }
        changed
    }

    /// Render a legacy structured log entry `{time, level, message}`.
    fn render_log_object(obj: &Map<String, Value>) -> String {
        let time = obj.get("time").and_then(Value::as_str).unwrap_or("");
        let level = obj.get("level").and_then(Value::as_str).unwrap_or("info");
        let message = obj.get("message").and_then(Value::as_str).unwrap_or("");
        format!("{} [{}] {}", time, level.to_uppercase(), message)
    }

    /// Upgrade a legacy task JSON value in place. Returns true when any
    /// conversion happened, i.e. the file should be rewritten.
    pub fn canonicalize(value: &mut Value) -> bool {
        let Some(obj) = value.as_object_mut() else {
            return false;
        };
        let mut changed = canonicalize_keys(obj);

        if let Some(Value::Array(targets)) = obj.get_mut("targets") {
            for target in targets {
                if let Some(target) = target.as_object_mut() {
                    changed |= canonicalize_keys(target);
                }
            }
        }

        if let Some(logs) = obj.get_mut("logs") {
            if let Value::String(joined) = logs {
                let lines: Vec<Value> = joined
                    .split('\n')
                    .filter(|l| !l.is_empty())
                    .map(|l| Value::String(l.to_string()))
                    .collect();
                *logs = Value::Array(lines);
                changed = true;
            } else if let Value::Array(items) = logs {
                for item in items.iter_mut() {
                    if let Value::Object(entry) = item {
                        *item = Value::String(render_log_object(entry));
                        changed = true;
                    }
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("tasks")).unwrap();
        (dir, store)
    }

    fn sample_task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            mode: TaskMode::Batch,
            source_ref: "src:latest".to_string(),
            source_id: String::new(),
            target_ref: String::new(),
            target_id: String::new(),
            targets: vec![
                TargetState::new("dst-a:latest".to_string(), String::new()),
                TargetState::new("dst-b:latest".to_string(), String::new()),
            ],
            status: SyncStatus::Running,
            fail_fast: false,
            max_retries: 2,
            concurrency: 2,
            timeout_seconds: 3600,
            cancel_requested: false,
            error_summary: String::new(),
            created_at: Utc::now(),
            ended_at: None,
            logs: vec![],
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store();
        let task = sample_task("task_1");
        store.save(&task).unwrap();
        let loaded = store.load("task_1").unwrap();
        assert_eq!(loaded, task);
    }

    #[test]
    fn test_load_upgrades_camel_case_and_completed() {
        let (_dir, store) = store();
        let legacy = json!({
            "id": "task_legacy",
            "sourceRef": "src:latest",
            "targetRef": "dst:latest",
            "status": "completed",
            "targets": [
                {"targetRef": "dst:latest", "status": "completed", "startedAt": "2024-01-01T00:00:00Z"}
            ],
            "failFast": true,
            "maxRetries": 1,
            "timeoutSeconds": 60,
            "createdAt": "2024-01-01T00:00:00Z",
            "endedAt": "2024-01-01T00:01:00Z",
            "logs": "12:00:00 [INFO] started\n12:00:01 [INFO] done"
        });
        let path = store.path("task_legacy");
        fsutil::atomic_write_json(&path, &legacy).unwrap();

        let task = store.load("task_legacy").unwrap();
        assert_eq!(task.source_ref, "src:latest");
        assert_eq!(task.status, SyncStatus::Success);
        assert_eq!(task.targets[0].status, SyncStatus::Success);
        assert!(task.fail_fast);
        assert_eq!(task.max_retries, 1);
        assert_eq!(task.timeout_seconds, 60);
        assert_eq!(task.logs.len(), 2);
        assert!(task.ended_at.is_some());

        // The file was rewritten in canonical form.
        let raw: Value = fsutil::read_json(&path).unwrap();
        assert!(raw.get("sourceRef").is_none());
        assert_eq!(raw["status"], "success");
        assert!(raw["logs"].is_array());

        // A second load performs no further conversion and agrees.
        let again = store.load("task_legacy").unwrap();
        assert_eq!(again, task);
    }

    #[test]
    fn test_load_renders_structured_logs() {
        let (_dir, store) = store();
        let legacy = json!({
            "id": "task_objlogs",
            "source_ref": "src:latest",
            "created_at": "2024-01-01T00:00:00Z",
            "logs": [
                {"time": "09:15:00", "level": "info", "message": "starting"},
                {"time": "09:15:02", "level": "warn", "message": "slow upstream"}
            ]
        });
        fsutil::atomic_write_json(&store.path("task_objlogs"), &legacy).unwrap();
        let task = store.load("task_objlogs").unwrap();
        assert_eq!(task.logs[0], "09:15:00 [INFO] starting");
        assert_eq!(task.logs[1], "09:15:02 [WARN] slow upstream");
    }

    #[test]
    fn test_list_is_newest_first_and_logless() {
        let (_dir, store) = store();
        let mut older = sample_task("task_a");
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        older.push_log("old line".to_string());
        let newer = sample_task("task_b");
        store.save(&older).unwrap();
        store.save(&newer).unwrap();

        let tasks = store.list().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "task_b");
        assert!(tasks[0].logs.is_empty() && tasks[1].logs.is_empty());
    }

    #[test]
    fn test_push_log_is_bounded() {
        let mut task = sample_task("task_logs");
        for i in 0..(MAX_TASK_LOGS + 10) {
            task.push_log(format!("line {}", i));
        }
        assert_eq!(task.logs.len(), MAX_TASK_LOGS);
        assert_eq!(task.logs[0], "line 10");
    }

    #[test]
    fn test_terminal_status_priority() {
        let mut task = sample_task("task_status");
        task.targets[0].status = SyncStatus::Failed;
        task.targets[1].status = SyncStatus::Canceled;
        assert_eq!(task.terminal_status(), SyncStatus::Failed);

        task.targets[0].status = SyncStatus::Success;
        assert_eq!(task.terminal_status(), SyncStatus::Canceled);

        task.targets[1].status = SyncStatus::Success;
        assert_eq!(task.terminal_status(), SyncStatus::Success);

        task.cancel_requested = true;
        assert_eq!(task.terminal_status(), SyncStatus::Canceled);
    }

    #[test]
    fn test_error_summary_format() {
        let mut task = sample_task("task_sum");
        task.targets[0].status = SyncStatus::Failed;
        task.targets[0].error = "unauthorized".to_string();
        task.targets[1].status = SyncStatus::Failed;
        assert_eq!(
            task.compose_error_summary(),
            "dst-a:latest: unauthorized; dst-b:latest: failed"
        );
    }
}
