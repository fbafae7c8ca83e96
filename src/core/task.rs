//! Task records, lifecycle states, and claim ordering.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::serde::{TaskId, Timestamp, UserId};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `scheduled_for` and a free worker.
    Pending,
    /// Claimed by exactly one worker.
    Running,
    /// Handler finished successfully.
    Completed,
    /// Permanently failed.
    Failed,
    /// Cancelled before it started.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable string form used by the durable backends.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status `{other}`")),
        }
    }
}

/// A unit of deferred work as stored in the task store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Unique, monotonically assigned identifier.
    pub id: TaskId,
    /// Selects the handler that processes this task.
    pub task_type: String,
    /// Opaque payload interpreted only by the handler.
    pub payload: serde_json::Value,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Higher runs first.
    pub priority: i32,
    /// Earliest eligible execution time.
    pub scheduled_for: Timestamp,
    /// Insertion time.
    pub created_at: Timestamp,
    /// Set when a worker claims the task.
    pub started_at: Option<Timestamp>,
    /// Set when the task reaches a terminal state.
    pub completed_at: Option<Timestamp>,
    /// Number of failed execution tries so far.
    pub attempts: u32,
    /// Ceiling before permanent failure.
    pub max_attempts: u32,
    /// Last failure description, diagnostics only.
    pub last_error: Option<String>,
    /// User the work is done on behalf of.
    pub owner: Option<UserId>,
    /// Domain entity identity used to avoid duplicate periodic enqueues.
    pub dedupe_key: Option<String>,
    /// Worker currently owning a `running` task.
    pub claimed_by: Option<String>,
}

impl Task {
    /// Whether the task can be claimed at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_for <= now
            && self.attempts < self.max_attempts
    }

    /// Ordering key used by `claim_next`.
    #[must_use]
    pub const fn claim_key(&self) -> ClaimKey {
        ClaimKey {
            priority: self.priority,
            scheduled_for: self.scheduled_for,
            id: self.id,
        }
    }
}

/// Claim order: highest priority, then earliest `scheduled_for`, then lowest id.
///
/// `Ord` is defined so that the task to run next compares as the greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimKey {
    /// Task priority.
    pub priority: i32,
    /// Earliest eligible execution time.
    pub scheduled_for: Timestamp,
    /// Insertion order tiebreaker.
    pub id: TaskId,
}

impl PartialOrd for ClaimKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClaimKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_for.cmp(&self.scheduled_for))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Request to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// Handler selector.
    pub task_type: String,
    /// Handler payload.
    pub payload: serde_json::Value,
    /// Earliest execution time; `None` means now.
    pub scheduled_for: Option<Timestamp>,
    /// Priority, higher runs first.
    pub priority: i32,
    /// Attempt ceiling; `None` takes the type's retry policy.
    pub max_attempts: Option<u32>,
    /// Owning user.
    pub owner: Option<UserId>,
    /// Domain entity identity for duplicate suppression.
    pub dedupe_key: Option<String>,
}

impl NewTask {
    /// Create a request for `task_type` carrying `payload`.
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            scheduled_for: None,
            priority: 0,
            max_attempts: None,
            owner: None,
            dedupe_key: None,
        }
    }

    /// Defer execution until `at`.
    #[must_use]
    pub const fn scheduled_for(mut self, at: Timestamp) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the attempt ceiling.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Attach the owning user.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<UserId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Attach a dedupe key.
    #[must_use]
    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Reject requests no backend should store.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.task_type.trim().is_empty() {
            return Err("task type must not be empty".into());
        }
        if self.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0".into());
        }
        if self.dedupe_key.as_deref().is_some_and(|k| k.is_empty()) {
            return Err("dedupe_key must not be empty when set".into());
        }
        Ok(())
    }

    /// Materialize the request into a `pending` task row.
    #[must_use]
    pub fn into_task(self, id: TaskId, now: Timestamp, default_max_attempts: u32) -> Task {
        Task {
            id,
            task_type: self.task_type,
            payload: self.payload,
            status: TaskStatus::Pending,
            priority: self.priority,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            created_at: now,
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: self.max_attempts.unwrap_or(default_max_attempts),
            last_error: None,
            owner: self.owner,
            dedupe_key: self.dedupe_key,
            claimed_by: None,
        }
    }
}

/// Query filter for queue inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Restrict to a status; `None` matches all.
    pub status: Option<TaskStatus>,
    /// Restrict to a task type.
    pub task_type: Option<String>,
    /// Restrict to an owner.
    pub owner: Option<UserId>,
    /// Only tasks scheduled at or before this time.
    pub due_before: Option<Timestamp>,
    /// Maximum rows returned; `None` is unbounded.
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Filter matching every pending task.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            ..Self::default()
        }
    }

    /// Restrict to `task_type`.
    #[must_use]
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Restrict to `owner`.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<UserId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Cap the number of rows.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `task` passes the filter (ignores `limit`).
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self.task_type.as_deref().is_none_or(|t| task.task_type == t)
            && self.owner.as_deref().is_none_or(|o| task.owner.as_deref() == Some(o))
            && self.due_before.is_none_or(|t| task.scheduled_for <= t)
    }
}
