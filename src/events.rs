//! In-process event fan-out and the wire frames it carries.
//!
//! One broadcast topic serves the whole process. The channel's ring
//! buffer means a slow subscriber loses the oldest frames instead of
//! ever blocking a publisher, which is exactly the contract the sync
//! applier needs: it broadcasts right after persisting and must never
//! stall on a dead WebSocket.

use crate::sync::task::{Task, TargetState};
use serde::Serialize;
use tokio::sync::broadcast;

const HUB_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<String>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Fan a frame out to all current subscribers. A hub with no
    /// subscribers swallows the frame.
    pub fn broadcast(&self, frame: String) {
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Structured payload inside a `TASK_EVENT` frame.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn frame(task_id: &str, event: &TaskEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("TASK_EVENT:{}:{}", task_id, json)
}

/// Task-level status frame.
pub fn task_update_frame(task: &Task) -> String {
    frame(
        &task.id,
        &TaskEvent {
            kind: "task_update",
            task_id: task.id.clone(),
            status: Some(task.status.to_string()),
            cancel_requested: Some(task.cancel_requested),
            target_ref: None,
            target_status: None,
            progress: None,
            attempts: None,
            error: None,
        },
    )
}

/// Target-level status/progress frame.
pub fn target_update_frame(task_id: &str, target: &TargetState) -> String {
    frame(
        task_id,
        &TaskEvent {
            kind: "target_update",
            task_id: task_id.to_string(),
            status: None,
            cancel_requested: None,
            target_ref: Some(target.target_ref.clone()),
            target_status: Some(target.status.to_string()),
            progress: Some(target.progress),
            attempts: Some(target.attempts),
            error: if target.error.is_empty() {
                None
            } else {
                Some(target.error.clone())
            },
        },
    )
}

/// Plain-text log frame: `TASK_LOG:<task_id>:<line>`.
pub fn task_log_frame(task_id: &str, line: &str) -> String {
    format!("TASK_LOG:{}:{}", task_id, line)
}

/// Legacy terminal frames kept for older subscribers.
pub fn terminal_frame(task: &Task) -> String {
    match task.status {
        crate::sync::task::SyncStatus::Success => format!("TASK_SUCCESS:{}", task.id),
        crate::sync::task::SyncStatus::Canceled => format!("TASK_FAILED:{}:canceled", task.id),
        _ => format!("TASK_FAILED:{}:failed", task.id),
    }
}
