//! Sync task orchestration.
//!
//! [`SyncOrchestrator`] is the public face: it plans requests into
//! durable tasks, hands them to the runner, and serves cancel/retry/
//! query traffic. Execution details live in the submodules: `plan` for
//! intake, `runner` for the supervisor/worker machinery, `task` for the
//! model and store, `copier` for the external copy contract, `retry`
//! for failure classification.

pub mod copier;
pub mod plan;
pub mod retry;
mod runner;
pub mod task;

use crate::archive::ArchiveStore;
use crate::credentials::CredentialStore;
use crate::error::{AppError, Result};
use crate::events::{self, EventHub};
use crate::sync::copier::CopierFactory;
use crate::sync::plan::{SyncRequest, TargetSpec};
use crate::sync::runner::{RunnerDeps, RunningMap, TaskHandle};
use crate::sync::task::{SyncStatus, Task, TaskStore, log_line};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Body of the retry endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub target_refs: Option<Vec<String>>,
    #[serde(default)]
    pub failed_only: Option<bool>,
}

pub struct SyncOrchestrator {
    store: Arc<TaskStore>,
    credentials: Arc<CredentialStore>,
    archives: Arc<ArchiveStore>,
    hub: EventHub,
    factory: Arc<dyn CopierFactory>,
    running: RunningMap,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<TaskStore>,
        credentials: Arc<CredentialStore>,
        archives: Arc<ArchiveStore>,
        hub: EventHub,
        factory: Arc<dyn CopierFactory>,
    ) -> Self {
        Self {
            store,
            credentials,
            archives,
            hub,
            factory,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Plan, persist and start a sync task; returns the initial snapshot.
    pub async fn execute_sync(&self, req: SyncRequest) -> Result<Task> {
        let plan = plan::plan_task(&req, &self.credentials)?;
        self.store.save(&plan.task)?;
        self.hub.broadcast(events::task_update_frame(&plan.task));

        let cancel = CancellationToken::new();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        self.running
            .lock()
            .expect("running-task registry poisoned")
            .insert(
                plan.task.id.clone(),
                TaskHandle {
                    cancel: cancel.clone(),
                    apply: apply_tx.clone(),
                },
            );

        let snapshot = plan.task.clone();
        let deps = RunnerDeps {
            store: self.store.clone(),
            hub: self.hub.clone(),
            factory: self.factory.clone(),
            archives: self.archives.clone(),
        };
        tokio::spawn(runner::run_task(
            plan,
            deps,
            cancel,
            apply_tx,
            apply_rx,
            self.running.clone(),
        ));
        Ok(snapshot)
    }

    /// All tasks, newest first, without logs.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.store.list()
    }

    /// Full task including logs.
    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.store.load(id)
    }

    pub fn task_count(&self) -> usize {
        self.store.count()
    }

    /// Request cancellation. Idempotent: repeated calls (and calls
    /// against an already-terminal task) are no-ops.
    pub async fn cancel(&self, id: &str) -> Result<Task> {
        let handle = {
            let running = self.running.lock().expect("running-task registry poisoned");
            running
                .get(id)
                .map(|h| (h.cancel.clone(), h.apply.clone()))
        };

        let Some((cancel, apply)) = handle else {
            let task = self.store.load(id)?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            // Persisted as running but no live supervisor: a previous
            // process died mid-task.
            return self.finalize_interrupted(task);
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        let _ = apply.send(Box::new(move |t: &mut Task| {
            let mut frames = Vec::new();
            if !t.cancel_requested {
                t.cancel_requested = true;
                let line = log_line("WARN", "cancellation requested");
                t.push_log(line.clone());
                frames.push(events::task_update_frame(t));
                frames.push(events::task_log_frame(&t.id, &line));
            }
            cancel.cancel();
            let _ = ack_tx.send(t.clone());
            frames
        }));
        match ack_rx.await {
            Ok(task) => Ok(task),
            // The task finished before the mutation was applied.
            Err(_) => self.store.load(id),
        }
    }

    /// Re-dispatch selected targets of a terminal task through the
    /// normal planning path, producing a new task id.
    pub async fn retry(&self, id: &str, req: &RetryRequest) -> Result<Task> {
        if self
            .running
            .lock()
            .expect("running-task registry poisoned")
            .contains_key(id)
        {
            return Err(AppError::conflict(format!("task {} is still running", id)));
        }
        let orig = self.store.load(id)?;
        if !orig.status.is_terminal() {
            return Err(AppError::conflict(format!("task {} is still running", id)));
        }

        let failed_only = req.failed_only.unwrap_or(true);
        let explicit = req
            .target_refs
            .as_ref()
            .filter(|refs| !refs.is_empty());
        let selected: Vec<TargetSpec> = orig
            .targets
            .iter()
            .filter(|t| match explicit {
                Some(refs) => refs.iter().any(|r| r == &t.target_ref),
                None => !failed_only || t.status == SyncStatus::Failed,
            })
            .map(|t| TargetSpec {
                target_ref: t.target_ref.clone(),
                target_id: t.target_id.clone(),
            })
            .collect();
        if selected.is_empty() {
            return Err(AppError::validation("no matching targets to retry"));
        }

        let new_req = SyncRequest {
            source_ref: orig.source_ref.clone(),
            source_id: orig.source_id.clone(),
            targets: selected,
            concurrency: Some(orig.concurrency),
            max_retries: Some(orig.max_retries),
            fail_fast: Some(orig.fail_fast),
            timeout_seconds: Some(orig.timeout_seconds),
            ..Default::default()
        };
        self.execute_sync(new_req).await
    }

    /// Startup recovery: any task persisted in a non-terminal status lost
    /// its supervisor with the previous process and is finalized as
    /// canceled. Returns how many tasks were finalized.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for summary in self.store.list()? {
            if summary.status.is_terminal() {
                continue;
            }
            match self
                .store
                .load(&summary.id)
                .and_then(|task| self.finalize_interrupted(task))
            {
                Ok(_) => recovered += 1,
                Err(err) => {
                    tracing::warn!(task_id = %summary.id, "failed to recover task: {}", err);
                }
            }
        }
        Ok(recovered)
    }

    fn finalize_interrupted(&self, mut task: Task) -> Result<Task> {
        let now = Utc::now();
        task.cancel_requested = true;
        for tg in &mut task.targets {
            if !tg.status.is_terminal() {
                tg.status = SyncStatus::Canceled;
                if tg.error.is_empty() {
                    tg.error = "canceled".to_string();
                }
                tg.ended_at = Some(now);
            }
        }
        task.status = task.terminal_status();
        task.error_summary = if task.status == SyncStatus::Failed {
            task.compose_error_summary()
        } else {
            String::new()
        };
        task.ended_at = Some(now);
        task.push_log(log_line("WARN", "interrupted by restart"));
        self.store.save(&task)?;
        self.hub.broadcast(events::task_update_frame(&task));
        self.hub.broadcast(events::terminal_frame(&task));
        Ok(task)
    }
}
