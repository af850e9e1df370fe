//! Service configuration and data-directory layout.

use crate::error::{AppError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Runtime configuration for the service.
///
/// The data directory is owned by a single process; every store below
/// roots its files here:
///
/// ```text
/// <data>/credentials.enc
/// <data>/tasks/<task_id>.json
/// <data>/archives.json
/// <data>/archives/<archive_id>/layout/...
/// <data>/pipes/<pipe_id>.json
/// <data>/pipes/versions/<pipe_id>/v<version>_<nanos>.json
/// <data>/pipes/ops/<pipe_id>/b_<nanos>.json
/// ```
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub listen: String,
}

impl AppConfig {
    pub fn new(data_dir: impl Into<PathBuf>, listen: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            listen: listen.into(),
        }
    }

    pub fn credentials_file(&self) -> PathBuf {
        self.data_dir.join("credentials.enc")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }

    pub fn archives_index(&self) -> PathBuf {
        self.data_dir.join("archives.json")
    }

    pub fn pipes_dir(&self) -> PathBuf {
        self.data_dir.join("pipes")
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            return Err(AppError::validation("listen address cannot be empty"));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::validation("data directory cannot be empty"));
        }
        Ok(())
    }

    /// Create the directory skeleton the stores expect.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir.as_path(),
            self.tasks_dir().as_path(),
            self.archives_dir().as_path(),
            self.pipes_dir().as_path(),
        ] {
            ensure_dir(dir)?;
        }
        Ok(())
    }
}

pub(crate) fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| AppError::Io(format!("failed to create {}: {}", dir.display(), e)))
}
