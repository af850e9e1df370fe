//! The Copier contract.
//!
//! The orchestrator never talks to a registry itself: each attempt
//! constructs one fresh [`Copier`] through a [`CopierFactory`], bound to
//! that attempt's cancellation scope and progress channel. The default
//! factory produces the HTTP copier in `registry::copier`; tests plug in
//! scripted implementations.

use crate::credentials::RegistryAuth;
use crate::error::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One progress report from a Copier. `percent` is in `[0, 1]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

impl Progress {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            message: message.into(),
            phase: None,
            percent: None,
        }
    }

    pub fn with_percent(mut self, phase: impl Into<String>, percent: f64) -> Self {
        self.phase = Some(phase.into());
        self.percent = Some(percent);
        self
    }
}

/// Everything one copy needs. `source_layout_path` is set when the
/// source is an `archive://` ref resolved to an OCI layout on disk.
#[derive(Debug, Clone, Default)]
pub struct CopyRequest {
    pub source_ref: String,
    pub target_ref: String,
    pub source_auth: Option<RegistryAuth>,
    pub target_auth: Option<RegistryAuth>,
    pub source_layout_path: Option<PathBuf>,
}

/// Copies one image (manifest list and all referenced blobs) from source
/// to target. Implementations must honor the cancellation token they were
/// constructed with and unwind promptly when it fires.
pub trait Copier: Send + Sync {
    fn sync_manifest_list<'a>(&'a self, req: &'a CopyRequest) -> BoxFuture<'a, Result<()>>;
}

/// Builds a Copier for one attempt.
pub trait CopierFactory: Send + Sync {
    fn create(&self, cancel: CancellationToken, progress: mpsc::Sender<Progress>)
    -> Box<dyn Copier>;
}
