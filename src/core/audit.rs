//! Audit sink implementations.
//!
//! Every task transition the engine performs can be mirrored to an audit sink.
//! Operator alerts (unregistered task types, exhausted store retries) are
//! recorded with [`AuditAction::Alert`].

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::core::task::Task;
use crate::util::serde::{TaskId, Timestamp};

/// Transition or notable event recorded for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Inserted as `pending`.
    Enqueued,
    /// Claimed by a worker.
    Claimed,
    /// Handler succeeded.
    Completed,
    /// Re-queued after a transient failure.
    Retried,
    /// Permanently failed.
    Failed,
    /// Completion rejected because the quota was exhausted.
    QuotaDenied,
    /// Cancelled while pending.
    Cancelled,
    /// Moved to a new time while pending.
    Rescheduled,
    /// Running task whose worker disappeared was released.
    Recovered,
    /// Something an operator must look at.
    Alert,
}

impl AuditAction {
    /// Stable snake_case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::QuotaDenied => "quota_denied",
            Self::Cancelled => "cancelled",
            Self::Rescheduled => "rescheduled",
            Self::Recovered => "recovered",
            Self::Alert => "alert",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audit event structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Related task identifier.
    pub task_id: TaskId,
    /// Related task type.
    pub task_type: String,
    /// Action taken.
    pub action: AuditAction,
    /// Worker involved, if any.
    pub worker_id: Option<String>,
    /// Timestamp milliseconds.
    pub created_at_ms: Timestamp,
    /// Additional context.
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Event for `task` at `now`.
    #[must_use]
    pub fn new(task: &Task, action: AuditAction, now: Timestamp) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            action,
            worker_id: task.claimed_by.clone(),
            created_at_ms: now,
            detail: None,
        }
    }

    /// Attach the acting worker.
    #[must_use]
    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Attach context.
    #[must_use]
    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Audit sink abstraction.
pub trait AuditSink: Send {
    /// Record an audit event.
    fn record(&mut self, event: AuditEvent);
}

/// In-memory audit sink for testing and dev.
pub struct InMemoryAuditSink {
    events: VecDeque<AuditEvent>,
    max_events: usize,
}

impl InMemoryAuditSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.iter().cloned().collect()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if self.max_events == 0 {
            return;
        }
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Sink that forwards events to `tracing`; alerts are emitted at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let detail = event.detail.as_deref().unwrap_or("");
        match event.action {
            AuditAction::Alert => error!(
                target: "work_queue::alert",
                task_id = event.task_id,
                task_type = %event.task_type,
                worker = event.worker_id.as_deref().unwrap_or("-"),
                "{detail}"
            ),
            AuditAction::Failed | AuditAction::QuotaDenied => warn!(
                target: "work_queue::audit",
                task_id = event.task_id,
                task_type = %event.task_type,
                action = %event.action,
                "{detail}"
            ),
            _ => info!(
                target: "work_queue::audit",
                task_id = event.task_id,
                task_type = %event.task_type,
                action = %event.action,
                "{detail}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::NewTask;

    #[test]
    fn in_memory_sink_is_bounded() {
        let task = NewTask::new("publish", serde_json::json!({})).into_task(1, 0, 3);
        let mut sink = InMemoryAuditSink::new(2);
        sink.record(AuditEvent::new(&task, AuditAction::Enqueued, 1));
        sink.record(AuditEvent::new(&task, AuditAction::Claimed, 2));
        sink.record(AuditEvent::new(&task, AuditAction::Completed, 3));
        let actions: Vec<_> = sink.events().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec![AuditAction::Claimed, AuditAction::Completed]);
    }
}
