//! Pipe store: versioned JSON documents with optimistic concurrency.
//!
//! A pipe is a named graph document. Explicit updates bump `version` and
//! write an immutable snapshot under `versions/<id>/`; autosaves
//! overwrite the document in place and only touch `updated_at`. The
//! persisted `updated_at` doubles as the concurrency token, compared at
//! nanosecond precision so consecutive autosaves stay distinguishable.
//! An append-only op log lives next to the versions, batched per write.

use crate::error::{AppError, Result};
use crate::fsutil;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

pub const MAX_OPS_PER_BATCH: usize = 2000;
pub const MAX_OPS_LIMIT: usize = 1000;
pub const DEFAULT_OPS_LIMIT: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipe {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_array")]
    pub nodes: Value,
    #[serde(default = "empty_array")]
    pub edges: Value,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

fn empty_array() -> Value {
    Value::Array(Vec::new())
}

/// Incoming create/update body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipeBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Option<Value>,
    #[serde(default)]
    pub edges: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeVersionInfo {
    pub version: i64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeOp {
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Options for [`PipeStore::update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub autosave: bool,
    pub force: bool,
    pub base_updated_at: Option<String>,
}

pub struct PipeStore {
    root: PathBuf,
    // All operations serialize on this; the document files are small and
    // the conflict check must see a settled updated_at.
    lock: Mutex<()>,
}

impl PipeStore {
    pub fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn doc_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    fn versions_dir(&self, id: &str) -> PathBuf {
        self.root.join("versions").join(id)
    }

    fn ops_dir(&self, id: &str) -> PathBuf {
        self.root.join("ops").join(id)
    }

    fn load(&self, id: &str) -> Result<Pipe> {
        fsutil::check_id(id)?;
        let path = self.doc_path(id);
        if !path.exists() {
            return Err(AppError::not_found(format!("pipe not found: {}", id)));
        }
        fsutil::read_json(&path)
    }

    pub fn create(&self, body: PipeBody) -> Result<Pipe> {
        let name = body.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::validation("name is required"));
        }
        let now = fsutil::now_rfc3339_nanos();
        let pipe = Pipe {
            id: fsutil::make_id("pipe"),
            name,
            description: body.description,
            nodes: body.nodes.unwrap_or_else(empty_array),
            edges: body.edges.unwrap_or_else(empty_array),
            version: 1,
            created_at: now.clone(),
            updated_at: now,
        };

        let _guard = self.lock.lock().expect("pipe store poisoned");
        fsutil::atomic_write_json(&self.doc_path(&pipe.id), &pipe)?;
        self.write_snapshot(&pipe)?;
        Ok(pipe)
    }

    pub fn get(&self, id: &str) -> Result<Pipe> {
        let _guard = self.lock.lock().expect("pipe store poisoned");
        self.load(id)
    }

    pub fn list(&self) -> Result<Vec<Pipe>> {
        let _guard = self.lock.lock().expect("pipe store poisoned");
        let mut pipes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || name.starts_with('.') {
                continue;
            }
            match fsutil::read_json::<Pipe>(&entry.path()) {
                Ok(pipe) => pipes.push(pipe),
                Err(err) => tracing::warn!(file = %name, "skipping unreadable pipe: {}", err),
            }
        }
        pipes.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(pipes)
    }

    pub fn count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| {
                        e.file_type().map(|t| t.is_file()).unwrap_or(false)
                            && e.file_name().to_string_lossy().ends_with(".json")
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    /// Update a pipe. `base_updated_at` (unless forced) must match the
    /// persisted `updated_at` to the nanosecond, otherwise the caller
    /// gets a conflict carrying the current version and token. Autosave
    /// keeps the version and writes no snapshot.
    pub fn update(&self, id: &str, body: PipeBody, opts: &UpdateOptions) -> Result<Pipe> {
        let _guard = self.lock.lock().expect("pipe store poisoned");
        let mut pipe = self.load(id)?;

        if let Some(base) = opts.base_updated_at.as_deref().filter(|b| !b.is_empty()) {
            if !opts.force {
                let base_nanos = rfc3339_nanos(base)?;
                let current_nanos = rfc3339_nanos(&pipe.updated_at)?;
                if base_nanos != current_nanos {
                    return Err(AppError::Conflict {
                        message: "pipe was modified concurrently".to_string(),
                        current_version: Some(pipe.version),
                        current_updated_at: Some(pipe.updated_at.clone()),
                    });
                }
            }
        }

        let name = body.name.trim();
        if !name.is_empty() {
            pipe.name = name.to_string();
        }
        pipe.description = body.description;
        if let Some(nodes) = body.nodes {
            pipe.nodes = nodes;
        }
        if let Some(edges) = body.edges {
            pipe.edges = edges;
        }

        pipe.updated_at = fsutil::now_rfc3339_nanos();
        if !opts.autosave {
            pipe.version += 1;
        }
        fsutil::atomic_write_json(&self.doc_path(id), &pipe)?;
        if !opts.autosave {
            self.write_snapshot(&pipe)?;
        }
        Ok(pipe)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock.lock().expect("pipe store poisoned");
        fsutil::check_id(id)?;
        let path = self.doc_path(id);
        if !path.exists() {
            return Err(AppError::not_found(format!("pipe not found: {}", id)));
        }
        fs::remove_file(&path)?;
        let _ = fs::remove_dir_all(self.versions_dir(id));
        let _ = fs::remove_dir_all(self.ops_dir(id));
        Ok(())
    }

    /// Version history, newest version first. Duplicate snapshots of a
    /// version keep the most recently updated one.
    pub fn list_versions(&self, id: &str) -> Result<Vec<PipeVersionInfo>> {
        let _guard = self.lock.lock().expect("pipe store poisoned");
        self.load(id)?;

        let mut best: HashMap<i64, (i64, String)> = HashMap::new();
        for snapshot in self.read_snapshots(id, None)? {
            let nanos = rfc3339_nanos(&snapshot.updated_at).unwrap_or(0);
            match best.get(&snapshot.version) {
                Some((existing, _)) if *existing >= nanos => {}
                _ => {
                    best.insert(snapshot.version, (nanos, snapshot.updated_at));
                }
            }
        }
        let mut versions: Vec<PipeVersionInfo> = best
            .into_iter()
            .map(|(version, (_, updated_at))| PipeVersionInfo {
                version,
                updated_at,
            })
            .collect();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }

    /// Fetch one version; among duplicate snapshots the latest wins.
    pub fn get_version(&self, id: &str, version: i64) -> Result<Pipe> {
        let _guard = self.lock.lock().expect("pipe store poisoned");
        self.load(id)?;

        self.read_snapshots(id, Some(version))?
            .into_iter()
            .max_by_key(|p| rfc3339_nanos(&p.updated_at).unwrap_or(0))
            .ok_or_else(|| {
                AppError::not_found(format!("pipe {} has no version {}", id, version))
            })
    }

    /// Append a batch of ops. Entries with an empty kind are dropped, a
    /// missing timestamp is filled in. Returns how many were persisted.
    pub fn append_ops(&self, id: &str, ops: Vec<PipeOp>) -> Result<usize> {
        if ops.len() > MAX_OPS_PER_BATCH {
            return Err(AppError::validation(format!(
                "at most {} ops per batch",
                MAX_OPS_PER_BATCH
            )));
        }
        let _guard = self.lock.lock().expect("pipe store poisoned");
        self.load(id)?;

        let mut batch: Vec<PipeOp> = ops
            .into_iter()
            .filter(|op| !op.kind.trim().is_empty())
            .collect();
        for op in &mut batch {
            if op.ts.is_empty() {
                op.ts = fsutil::now_rfc3339_nanos();
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }
        let path = self
            .ops_dir(id)
            .join(format!("b_{}.json", fsutil::now_nanos()));
        fsutil::atomic_write_json(&path, &batch)?;
        Ok(batch.len())
    }

    /// Most recent ops first, across batches, up to `limit`.
    pub fn list_ops(&self, id: &str, limit: Option<usize>) -> Result<Vec<PipeOp>> {
        let limit = limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_OPS_LIMIT)
            .min(MAX_OPS_LIMIT);
        let _guard = self.lock.lock().expect("pipe store poisoned");
        self.load(id)?;

        let dir = self.ops_dir(id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<String> = fs::read_dir(&dir)?
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("b_") && n.ends_with(".json"))
            .collect();
        files.sort_by(|a, b| b.cmp(a));

        let mut ops = Vec::new();
        for file in files {
            let batch: Vec<PipeOp> = match fsutil::read_json(&dir.join(&file)) {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(file = %file, "skipping unreadable op batch: {}", err);
                    continue;
                }
            };
            for op in batch.into_iter().rev() {
                ops.push(op);
                if ops.len() >= limit {
                    return Ok(ops);
                }
            }
        }
        Ok(ops)
    }

    fn write_snapshot(&self, pipe: &Pipe) -> Result<()> {
        let path = self.versions_dir(&pipe.id).join(format!(
            "v{}_{}.json",
            pipe.version,
            fsutil::now_nanos()
        ));
        fsutil::atomic_write_json(&path, pipe)
    }

    fn read_snapshots(&self, id: &str, version: Option<i64>) -> Result<Vec<Pipe>> {
        let dir = self.versions_dir(id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = version.map(|v| format!("v{}_", v));
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&dir)?.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") || !name.starts_with('v') {
                continue;
            }
            if let Some(prefix) = &prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            match fsutil::read_json::<Pipe>(&entry.path()) {
                Ok(pipe) => snapshots.push(pipe),
                Err(err) => tracing::warn!(file = %name, "skipping unreadable snapshot: {}", err),
            }
        }
        Ok(snapshots)
    }
}

fn rfc3339_nanos(value: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(value)
        .map_err(|e| AppError::validation(format!("invalid timestamp {:?}: {}", value, e)))?
        .timestamp_nanos_opt()
        .ok_or_else(|| AppError::validation(format!("timestamp out of range: {:?}", value)))
}
