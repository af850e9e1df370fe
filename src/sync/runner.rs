//! Task execution: supervisor, apply queue and per-target workers.
//!
//! One supervisor owns each task. It spawns one worker per target behind
//! a counting semaphore sized to the task's concurrency bound, and a
//! single applier consuming a queue of state mutations. Workers never
//! touch the `Task` directly: they post closures, and the applier runs
//! each one, persists the task file, then broadcasts whatever frames the
//! closure produced. That makes the event stream a faithful projection
//! of the persisted sequence without any lock shared with the Copier's
//! progress path.

use crate::archive::ArchiveStore;
use crate::credentials::RegistryAuth;
use crate::error::{AppError, Result};
use crate::events::{self, EventHub};
use crate::refs;
use crate::sync::copier::{CopierFactory, CopyRequest, Progress};
use crate::sync::plan::SyncPlan;
use crate::sync::retry;
use crate::sync::task::{SyncStatus, Task, TaskStore, log_line};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A queued state mutation: applied to the task, then persisted, then
/// the returned frames are broadcast.
pub(crate) type Mutation = Box<dyn FnOnce(&mut Task) -> Vec<String> + Send>;

pub(crate) type ApplySender = mpsc::UnboundedSender<Mutation>;

/// Control handle for an in-flight task.
pub(crate) struct TaskHandle {
    pub cancel: CancellationToken,
    pub apply: ApplySender,
}

pub(crate) type RunningMap = Arc<Mutex<HashMap<String, TaskHandle>>>;

/// Shared collaborators the runner needs.
#[derive(Clone)]
pub(crate) struct RunnerDeps {
    pub store: Arc<TaskStore>,
    pub hub: EventHub,
    pub factory: Arc<dyn CopierFactory>,
    pub archives: Arc<ArchiveStore>,
}

/// Everything one worker needs to drive its target.
struct TargetCtx {
    task_id: String,
    idx: usize,
    target_ref: String,
    source_ref: String,
    source_auth: Option<RegistryAuth>,
    target_auth: Option<RegistryAuth>,
    fail_fast: bool,
    max_retries: u32,
    timeout_seconds: u64,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    apply: ApplySender,
    factory: Arc<dyn CopierFactory>,
    archives: Arc<ArchiveStore>,
}

fn send_mutation<F>(ctx: &TargetCtx, f: F)
where
    F: FnOnce(&mut Task) -> Vec<String> + Send + 'static,
{
    // The applier only goes away after every worker finished, so a send
    // failure here can be ignored.
    let _ = ctx.apply.send(Box::new(f));
}

/// Run a planned task to completion. The initial snapshot is already
/// persisted and announced by the caller.
pub(crate) async fn run_task(
    plan: SyncPlan,
    deps: RunnerDeps,
    cancel: CancellationToken,
    apply_tx: ApplySender,
    apply_rx: mpsc::UnboundedReceiver<Mutation>,
    running: RunningMap,
) {
    let task = plan.task;
    let task_id = task.id.clone();
    let source_ref = task.source_ref.clone();
    let fail_fast = task.fail_fast;
    let max_retries = task.max_retries;
    let timeout_seconds = task.timeout_seconds;
    let semaphore = Arc::new(Semaphore::new(task.concurrency));
    let target_refs: Vec<String> = task.targets.iter().map(|t| t.target_ref.clone()).collect();

    let applier = spawn_applier(task, apply_rx, deps.store.clone(), deps.hub.clone());

    let mut workers = Vec::new();
    for (idx, target_auth) in plan.target_auths.into_iter().enumerate() {
        let ctx = Arc::new(TargetCtx {
            task_id: task_id.clone(),
            idx,
            target_ref: target_refs[idx].clone(),
            source_ref: source_ref.clone(),
            source_auth: plan.source_auth.clone(),
            target_auth,
            fail_fast,
            max_retries,
            timeout_seconds,
            cancel: cancel.clone(),
            semaphore: semaphore.clone(),
            apply: apply_tx.clone(),
            factory: deps.factory.clone(),
            archives: deps.archives.clone(),
        });
        workers.push(tokio::spawn(run_target(ctx)));
    }
    futures::future::join_all(workers).await;

    // Finalization runs through the queue like every other mutation.
    let _ = apply_tx.send(Box::new(finalize));
    drop(apply_tx);
    if let Err(err) = applier.await {
        tracing::error!(task_id = %task_id, "task applier aborted: {}", err);
    }

    running
        .lock()
        .expect("running-task registry poisoned")
        .remove(&task_id);
    tracing::debug!(task_id = %task_id, "supervisor finished");
}

fn spawn_applier(
    mut task: Task,
    mut rx: mpsc::UnboundedReceiver<Mutation>,
    store: Arc<TaskStore>,
    hub: EventHub,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mutation) = rx.recv().await {
            let frames = mutation(&mut task);
            if let Err(err) = store.save(&task) {
                tracing::error!(task_id = %task.id, "failed to persist task state: {}", err);
            }
            for frame in frames {
                hub.broadcast(frame);
            }
        }
    })
}

/// Terminal bookkeeping once every worker returned: force lingering
/// non-terminal targets to canceled, compute the task status by the
/// priority rule, compose the failure summary, stamp the end time.
fn finalize(task: &mut Task) -> Vec<String> {
    let task_id = task.id.clone();
    let now = Utc::now();
    let mut frames = Vec::new();
    for i in 0..task.targets.len() {
        if !task.targets[i].status.is_terminal() {
            task.targets[i].status = SyncStatus::Canceled;
            if task.targets[i].error.is_empty() {
                task.targets[i].error = "canceled".to_string();
            }
            task.targets[i].ended_at = Some(now);
            frames.push(events::target_update_frame(&task_id, &task.targets[i]));
        }
    }
    task.status = task.terminal_status();
    task.error_summary = if task.status == SyncStatus::Failed {
        task.compose_error_summary()
    } else {
        String::new()
    };
    task.ended_at = Some(now);
    let line = log_line("INFO", &format!("task finished with status {}", task.status));
    task.push_log(line.clone());
    frames.push(events::task_log_frame(&task_id, &line));
    frames.push(events::task_update_frame(task));
    frames.push(events::terminal_frame(task));
    frames
}

/// Drive one target through its attempts.
async fn run_target(ctx: Arc<TargetCtx>) {
    let _permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    // A cancel that lands while we were queued behind the semaphore means
    // this target never starts.
    if ctx.cancel.is_cancelled() {
        mark_canceled(&ctx, "canceled".to_string());
        return;
    }

    let idx = ctx.idx;
    send_mutation(&ctx, move |t| {
        let task_id = t.id.clone();
        let now = Utc::now();
        {
            let tg = &mut t.targets[idx];
            tg.status = SyncStatus::Running;
            tg.started_at = Some(now);
            tg.progress = 0.05;
            tg.attempts = 0;
            tg.error.clear();
        }
        let line = log_line(
            "INFO",
            &format!("syncing to {}", t.targets[idx].target_ref),
        );
        t.push_log(line.clone());
        vec![
            events::target_update_frame(&task_id, &t.targets[idx]),
            events::task_log_frame(&task_id, &line),
        ]
    });

    for attempt in 0..=ctx.max_retries {
        if ctx.cancel.is_cancelled() {
            mark_canceled(&ctx, "canceled".to_string());
            return;
        }

        send_mutation(&ctx, move |t| {
            let task_id = t.id.clone();
            {
                let tg = &mut t.targets[idx];
                tg.attempts = attempt + 1;
                tg.progress = 0.1;
                tg.error.clear();
            }
            vec![events::target_update_frame(&task_id, &t.targets[idx])]
        });

        match run_attempt(&ctx).await {
            Ok(()) => {
                send_mutation(&ctx, move |t| {
                    let task_id = t.id.clone();
                    {
                        let tg = &mut t.targets[idx];
                        tg.status = SyncStatus::Success;
                        tg.ended_at = Some(Utc::now());
                        tg.progress = 1.0;
                        tg.error.clear();
                    }
                    let line = log_line(
                        "INFO",
                        &format!("synced to {}", t.targets[idx].target_ref),
                    );
                    t.push_log(line.clone());
                    vec![
                        events::target_update_frame(&task_id, &t.targets[idx]),
                        events::task_log_frame(&task_id, &line),
                    ]
                });
                return;
            }
            Err(err) => {
                let msg = err.to_string();
                let cancelish = err.is_cancellation() || retry::is_cancellation(&msg);

                // A cancellation error is terminal only when a user or
                // fail-fast cancel is actually in flight; otherwise it is
                // transient propagation out of the Copier and retryable.
                if cancelish && ctx.cancel.is_cancelled() {
                    mark_canceled(&ctx, msg);
                    return;
                }
                let retryable = retry::is_retryable(&msg) || cancelish;

                if retryable && attempt < ctx.max_retries && !ctx.cancel.is_cancelled() {
                    let delay = retry::backoff_delay(attempt);
                    let retry_msg = msg.clone();
                    send_mutation(&ctx, move |t| {
                        let task_id = t.id.clone();
                        {
                            let tg = &mut t.targets[idx];
                            tg.error = retry_msg.clone();
                            tg.progress = 0.1;
                        }
                        let line = log_line(
                            "WARN",
                            &format!(
                                "attempt {} failed ({}), retrying in {}ms",
                                attempt + 1,
                                retry_msg,
                                delay.as_millis()
                            ),
                        );
                        t.push_log(line.clone());
                        vec![
                            events::target_update_frame(&task_id, &t.targets[idx]),
                            events::task_log_frame(&task_id, &line),
                        ]
                    });
                    // The sleep wakes early only when the task itself is
                    // canceled; the next loop iteration observes it.
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => {}
                    }
                    continue;
                }

                mark_failed(&ctx, msg);
                return;
            }
        }
    }
}

/// One Copier invocation with its own deadline and cancellation scope.
async fn run_attempt(ctx: &Arc<TargetCtx>) -> Result<()> {
    let source_layout_path = if ctx.source_ref.starts_with(refs::ARCHIVE_SCHEME) {
        Some(ctx.archives.resolve(&ctx.source_ref)?)
    } else {
        None
    };

    let attempt_token = ctx.cancel.child_token();
    let (progress_tx, progress_rx) = mpsc::channel::<Progress>(64);
    let copier = ctx.factory.create(attempt_token.clone(), progress_tx);
    let drain = tokio::spawn(drain_progress(progress_rx, ctx.clone()));

    let req = CopyRequest {
        source_ref: ctx.source_ref.clone(),
        target_ref: ctx.target_ref.clone(),
        source_auth: ctx.source_auth.clone(),
        target_auth: ctx.target_auth.clone(),
        source_layout_path,
    };

    let result = tokio::select! {
        res = copier.sync_manifest_list(&req) => res,
        _ = ctx.cancel.cancelled() => Err(AppError::Canceled("canceled".to_string())),
        _ = tokio::time::sleep(Duration::from_secs(ctx.timeout_seconds)) => Err(
            AppError::upstream(format!(
                "context deadline exceeded after {}s",
                ctx.timeout_seconds
            )),
        ),
    };

    // Tear down the attempt scope so a Copier that ignored the outcome
    // unwinds, then let the progress drain flush before the terminal
    // mutation is posted: per-target event order must end with the
    // terminal frame.
    attempt_token.cancel();
    drop(copier);
    let _ = drain.await;
    result
}

/// Relay Copier progress into logs and monotonic progress updates.
async fn drain_progress(mut rx: mpsc::Receiver<Progress>, ctx: Arc<TargetCtx>) {
    let idx = ctx.idx;
    while let Some(progress) = rx.recv().await {
        send_mutation(&ctx, move |t| {
            let task_id = t.id.clone();
            let mut frames = Vec::new();
            let line = log_line(&progress.level, &progress.message);
            t.push_log(line.clone());
            frames.push(events::task_log_frame(&task_id, &line));
            if let Some(percent) = progress.percent {
                if percent > t.targets[idx].progress {
                    t.targets[idx].progress = percent.min(1.0);
                    frames.push(events::target_update_frame(&task_id, &t.targets[idx]));
                }
            }
            frames
        });
    }
}

fn mark_canceled(ctx: &TargetCtx, error: String) {
    let idx = ctx.idx;
    send_mutation(ctx, move |t| {
        let task_id = t.id.clone();
        {
            let tg = &mut t.targets[idx];
            tg.status = SyncStatus::Canceled;
            tg.error = error.clone();
            tg.ended_at = Some(Utc::now());
        }
        let line = log_line(
            "WARN",
            &format!("target {} canceled", t.targets[idx].target_ref),
        );
        t.push_log(line.clone());
        vec![
            events::target_update_frame(&task_id, &t.targets[idx]),
            events::task_log_frame(&task_id, &line),
        ]
    });
}

fn mark_failed(ctx: &TargetCtx, error: String) {
    let idx = ctx.idx;
    let fail_fast = ctx.fail_fast;
    let token = ctx.cancel.clone();
    send_mutation(ctx, move |t| {
        let task_id = t.id.clone();
        {
            let tg = &mut t.targets[idx];
            tg.status = SyncStatus::Failed;
            tg.ended_at = Some(Utc::now());
            tg.progress = 0.0;
            tg.error = error.clone();
        }
        let line = log_line(
            "ERROR",
            &format!("target {} failed: {}", t.targets[idx].target_ref, error),
        );
        t.push_log(line.clone());
        let mut frames = vec![
            events::target_update_frame(&task_id, &t.targets[idx]),
            events::task_log_frame(&task_id, &line),
        ];
        if fail_fast && !t.cancel_requested {
            t.cancel_requested = true;
            let line = log_line("WARN", "Fail-fast: canceling remaining targets");
            t.push_log(line.clone());
            frames.push(events::task_update_frame(t));
            frames.push(events::task_log_frame(&task_id, &line));
            // Fired inside the applier: the flag is persisted with this
            // same mutation before any worker can observe the token.
            token.cancel();
        }
        frames
    });
}
