//! Durable-state helpers: atomic JSON writes, time-ordered ids, path guards.
//!
//! Every authoritative JSON file in the data directory goes through
//! [`atomic_write_json`] so a crash mid-write never leaves a partial file
//! observable: the payload lands in a temp file inside the destination
//! directory and is renamed into place.

use crate::error::{AppError, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

/// Nanoseconds since the Unix epoch, the ordering component of every id.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// RFC3339 timestamp with nanosecond precision. Nanosecond resolution is
/// load-bearing for the pipe store, where `updated_at` doubles as the
/// optimistic-concurrency token.
pub fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Mint a time-ordered id like `task_1722500000000000000`.
pub fn make_id(prefix: &str) -> String {
    format!("{}_{}", prefix, now_nanos())
}

/// Keep `[A-Za-z0-9_-]`, replace everything else with `_`.
pub fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Reject ids that could escape their store directory.
pub fn check_id(id: &str) -> Result<()> {
    let plain = !id.is_empty()
        && !id.contains('/')
        && !id.contains('\\')
        && !id.contains("..")
        && Path::new(id)
            .file_name()
            .map(|n| n.to_string_lossy() == id)
            .unwrap_or(false);
    if plain {
        Ok(())
    } else {
        Err(AppError::validation(format!("invalid id: {:?}", id)))
    }
}

/// Serialize `value` and atomically replace `path` with it.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data)
}

/// Atomically replace `path` with `data` via write-temp-then-rename.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Io(format!("no parent directory for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| AppError::Io(format!("no file name in {}", path.display())))?
        .to_string_lossy();
    let tmp: PathBuf = dir.join(format!(".{}.tmp-{}", file_name, now_nanos()));
    fs::write(&tmp, data)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)
        .map_err(|e| AppError::Io(format!("failed to read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&data)
        .map_err(|e| AppError::Parse(format!("failed to parse {}: {}", path.display(), e)))
}

/// Recursive size of a directory in bytes. Unreadable entries are skipped.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}
