//! Task store abstraction.
//!
//! The store is the single source of truth for scheduling state. Every
//! transition is a predicate-guarded write: `claim_next` only takes rows that
//! are still `pending`, `complete`/`fail` only touch rows that are `running`
//! under the reporting worker's claim, and `cancel`/`reschedule` only touch rows that are `pending`.

use crate::core::ledger::{Ledger, UsageCharge};
use crate::core::task::{NewTask, Task, TaskFilter};
use crate::core::SchedulerError;
use crate::util::serde::{TaskId, Timestamp};

/// `last_error` recorded when a quota-gated completion is rejected.
pub const QUOTA_EXCEEDED_ERROR: &str = "quota exceeded";

/// `last_error` recorded when a running task's worker disappeared.
pub const WORKER_LOST_ERROR: &str = "worker lost before reporting an outcome";

/// Attempt ceiling used when a request does not specify one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// How a failed try is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Retryable failure: consumes an attempt and re-queues at `retry_at`
    /// unless the attempt ceiling is reached.
    Transient {
        /// Diagnostic message.
        error: String,
        /// Next eligible time.
        retry_at: Timestamp,
    },
    /// Non-retryable failure: terminal without consuming an attempt.
    Permanent {
        /// Diagnostic message.
        error: String,
    },
}

/// Result of a completion report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The task moved to `completed` (and consumed quota if charged).
    Completed(Task),
    /// The task was already `completed`; nothing changed.
    AlreadyCompleted(Task),
    /// The charged quota was exhausted; the task moved to `failed`.
    QuotaDenied(Task),
}

impl Completion {
    /// Task state after the report.
    #[must_use]
    pub const fn task(&self) -> &Task {
        match self {
            Self::Completed(t) | Self::AlreadyCompleted(t) | Self::QuotaDenied(t) => t,
        }
    }
}

/// Durable table of task records.
pub trait TaskStore: Send + Sync {
    /// Insert a new `pending` task.
    ///
    /// # Errors
    ///
    /// `Validation` for malformed requests, `StoreUnavailable` if unreachable.
    fn insert(&self, task: NewTask, now: Timestamp) -> Result<TaskId, SchedulerError>;

    /// Insert unless a `pending` or `running` task with the same type and
    /// dedupe key exists. Returns `None` when suppressed.
    ///
    /// # Errors
    ///
    /// `Validation` if the request has no dedupe key.
    fn insert_unique(&self, task: NewTask, now: Timestamp)
        -> Result<Option<TaskId>, SchedulerError>;

    /// Atomically select and mark `running` the next eligible task.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the backend cannot be reached.
    fn claim_next(&self, worker_id: &str, now: Timestamp) -> Result<Option<Task>, SchedulerError>;

    /// Mark a task running under `worker_id` completed, optionally consuming
    /// one quota unit in the same atomic step. Idempotent for
    /// already-completed tasks.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotRunning` for pending tasks, `NotOwner` when another
    /// worker holds the claim, `AlreadyTerminal` for failed or cancelled tasks.
    fn complete(
        &self,
        id: TaskId,
        worker_id: &str,
        charge: Option<&UsageCharge>,
        now: Timestamp,
    ) -> Result<Completion, SchedulerError>;

    /// Record a failed try of a task running under `worker_id`.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotRunning` if the task is not running, or `NotOwner`
    /// when another worker holds the claim.
    fn fail(
        &self,
        id: TaskId,
        worker_id: &str,
        failure: Failure,
        now: Timestamp,
    ) -> Result<Task, SchedulerError>;

    /// Cancel a pending task.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` or `AlreadyTerminal` when not cancellable.
    fn cancel(&self, id: TaskId, now: Timestamp) -> Result<Task, SchedulerError>;

    /// Move a pending task to a new eligible time.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` or `AlreadyTerminal` when not pending.
    fn reschedule(&self, id: TaskId, at: Timestamp) -> Result<Task, SchedulerError>;

    /// Fetch one task.
    ///
    /// # Errors
    ///
    /// `NotFound` if no such task exists.
    fn get(&self, id: TaskId) -> Result<Task, SchedulerError>;

    /// Tasks matching `filter`, in claim order for pending rows and id order otherwise.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the backend cannot be reached.
    fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError>;

    /// Treat `running` tasks claimed before `started_before` as transiently
    /// failed so they are retried under the normal attempt ceiling.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the backend cannot be reached.
    fn recover_stale(
        &self,
        started_before: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Task>, SchedulerError>;
}

/// A task store and ledger sharing one atomic unit of storage.
pub trait Backend: TaskStore + Ledger {}

impl<T: TaskStore + Ledger> Backend for T {}

pub(crate) fn require_dedupe_key(task: &NewTask) -> Result<(), SchedulerError> {
    if task.dedupe_key.is_none() {
        return Err(SchedulerError::Validation(
            "insert_unique requires a dedupe_key".into(),
        ));
    }
    Ok(())
}

pub(crate) fn require_owner(task: &Task, worker_id: &str) -> Result<(), SchedulerError> {
    match task.claimed_by.as_deref() {
        Some(owner) if owner == worker_id => Ok(()),
        owner => Err(SchedulerError::NotOwner {
            id: task.id,
            owner: owner.map(str::to_string),
        }),
    }
}
