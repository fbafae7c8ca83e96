//! Producer-facing API and request/response models.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::retry::RetryPolicies;
use crate::core::slots::{conflicts, WeeklySchedule};
use crate::core::store::Backend;
use crate::core::task::{NewTask, Task, TaskFilter, TaskStatus};
use crate::core::wake::WakeChannel;
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::serde::{TaskId, Timestamp, UserId};

/// Optional fields of an enqueue call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Earliest execution time; now when unset.
    pub scheduled_for: Option<Timestamp>,
    /// Priority, higher runs first.
    pub priority: i32,
    /// Attempt ceiling; the type's retry policy when unset.
    pub max_attempts: Option<u32>,
    /// Owning user.
    pub owner: Option<UserId>,
    /// Dedupe key.
    pub dedupe_key: Option<String>,
}

impl EnqueueOptions {
    fn apply(self, mut task: NewTask) -> NewTask {
        task.scheduled_for = self.scheduled_for;
        task.priority = self.priority;
        task.max_attempts = self.max_attempts;
        task.owner = self.owner;
        task.dedupe_key = self.dedupe_key;
        task
    }
}

/// Days ahead searched for free slots when rebalancing.
pub const REBALANCE_HORIZON_DAYS: u32 = 365;

/// Outcome of [`Producer::rebalance_pending`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Free slots found before the latest pending task.
    pub gaps: usize,
    /// Tasks moved, with their new times.
    pub moved: Vec<(TaskId, Timestamp)>,
}

/// Handle used by request handlers and jobs to put work on the queue.
#[derive(Clone)]
pub struct Producer {
    backend: Arc<dyn Backend>,
    wake: Arc<dyn WakeChannel>,
    policies: Arc<RetryPolicies>,
    clock: Arc<dyn Clock>,
    schedule: WeeklySchedule,
}

impl Producer {
    /// Create a producer with the default weekly schedule.
    pub fn new(
        backend: Arc<dyn Backend>,
        wake: Arc<dyn WakeChannel>,
        policies: RetryPolicies,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            wake,
            policies: Arc::new(policies),
            clock,
            schedule: WeeklySchedule::default(),
        }
    }

    /// Use `schedule` for [`next_publish_slot`](Self::next_publish_slot).
    #[must_use]
    pub fn with_schedule(mut self, schedule: WeeklySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Backend the producer writes to.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Serialize `payload` and enqueue a `task_type` task.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty type or unserializable payload,
    /// `StoreUnavailable` if the insert could not be made.
    pub fn enqueue<P: Serialize + ?Sized>(
        &self,
        task_type: &str,
        payload: &P,
        options: EnqueueOptions,
    ) -> Result<TaskId, SchedulerError> {
        if task_type.trim().is_empty() {
            return Err(SchedulerError::Validation("task type must not be empty".into()));
        }
        let payload = serde_json::to_value(payload)
            .map_err(|e| SchedulerError::Validation(format!("payload not serializable: {e}")))?;
        self.enqueue_task(options.apply(NewTask::new(task_type, payload)))
    }

    /// Enqueue a prepared request.
    ///
    /// # Errors
    ///
    /// `Validation` for malformed requests, `StoreUnavailable` on store failure.
    pub fn enqueue_task(&self, task: NewTask) -> Result<TaskId, SchedulerError> {
        let task = self.with_policy_ceiling(task);
        let task_type = task.task_type.clone();
        let id = self.backend.insert(task, self.clock.now_ms())?;
        info!(task_id = id, task_type = %task_type, "task enqueued");
        self.wake.notify();
        Ok(id)
    }

    /// Enqueue unless a live task with the same type and dedupe key exists.
    ///
    /// # Errors
    ///
    /// `Validation` if the request has no dedupe key.
    pub fn enqueue_unique(&self, task: NewTask) -> Result<Option<TaskId>, SchedulerError> {
        let task = self.with_policy_ceiling(task);
        let task_type = task.task_type.clone();
        let inserted = self.backend.insert_unique(task, self.clock.now_ms())?;
        match inserted {
            Some(id) => {
                info!(task_id = id, task_type = %task_type, "task enqueued");
                self.wake.notify();
            }
            None => debug!(task_type = %task_type, "duplicate enqueue suppressed"),
        }
        Ok(inserted)
    }

    fn with_policy_ceiling(&self, mut task: NewTask) -> NewTask {
        if task.max_attempts.is_none() {
            task.max_attempts = Some(self.policies.for_type(&task.task_type).max_attempts);
        }
        task
    }

    /// Cancel a pending task.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` once claimed, `AlreadyTerminal` once finished.
    pub fn cancel(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let task = self.backend.cancel(id, self.clock.now_ms())?;
        info!(task_id = id, "task cancelled");
        Ok(task)
    }

    /// Move a pending task to `at`.
    ///
    /// # Errors
    ///
    /// `Validation` if `at` is in the past, otherwise as for `cancel`.
    pub fn reschedule(&self, id: TaskId, at: Timestamp) -> Result<Task, SchedulerError> {
        let now = self.clock.now_ms();
        if at < now {
            return Err(SchedulerError::Validation(format!(
                "cannot reschedule task {id} into the past ({at} < {now})"
            )));
        }
        let task = self.backend.reschedule(id, at)?;
        info!(task_id = id, scheduled_for = at, "task rescheduled");
        self.wake.notify();
        Ok(task)
    }

    /// Current record of one task.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub fn get_status(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.backend.get(id)
    }

    /// Pending tasks matching `filter`, in claim order.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub fn list_pending(&self, mut filter: TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        filter.status = Some(TaskStatus::Pending);
        self.backend.list(&filter)
    }

    /// First weekly slot not already occupied by a pending `task_type` task.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub fn next_publish_slot(&self, task_type: &str) -> Result<Timestamp, SchedulerError> {
        let taken = self.pending_times(task_type)?;
        Ok(self.schedule.next_free_slot(self.clock.now_ms(), &taken))
    }

    /// Pending `task_type` tasks scheduled within a minute of `at`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub fn slot_conflicts(
        &self,
        task_type: &str,
        at: Timestamp,
    ) -> Result<Vec<Task>, SchedulerError> {
        let pending = self.list_pending(TaskFilter::pending().with_type(task_type))?;
        let times: Vec<Timestamp> = pending.iter().map(|t| t.scheduled_for).collect();
        let clashing = conflicts(&times, at);
        Ok(pending
            .into_iter()
            .filter(|t| clashing.contains(&t.scheduled_for))
            .collect())
    }

    /// Pull the latest pending `task_type` tasks forward into free weekly
    /// slots, so the queue occupies consecutive slots from now on. A task is
    /// only ever moved earlier; tasks claimed in the meantime are skipped.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` on store failure.
    pub fn rebalance_pending(&self, task_type: &str) -> Result<RebalanceReport, SchedulerError> {
        let now = self.clock.now_ms();
        let mut pending = self.list_pending(TaskFilter::pending().with_type(task_type))?;
        pending.sort_by_key(|t| (t.scheduled_for, t.id));
        let taken: Vec<Timestamp> = pending.iter().map(|t| t.scheduled_for).collect();
        let latest = taken.last().copied().unwrap_or(now);
        let gaps: Vec<Timestamp> = self
            .schedule
            .expected_slots(now, REBALANCE_HORIZON_DAYS)
            .into_iter()
            .filter(|&slot| slot < latest && conflicts(&taken, slot).is_empty())
            .collect();

        let mut report = RebalanceReport {
            gaps: gaps.len(),
            moved: Vec::new(),
        };
        for gap in gaps {
            let Some(task) = pending.pop() else {
                break;
            };
            if gap >= task.scheduled_for {
                break;
            }
            match self.backend.reschedule(task.id, gap) {
                Ok(_) => report.moved.push((task.id, gap)),
                Err(e @ (SchedulerError::AlreadyRunning(_) | SchedulerError::AlreadyTerminal { .. })) => {
                    debug!(task_id = task.id, "skipping task during rebalance: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        if report.moved.is_empty() {
            debug!(task_type, gaps = report.gaps, "schedule already balanced");
        } else {
            info!(task_type, moved = report.moved.len(), "pending tasks rebalanced");
            self.wake.notify();
        }
        Ok(report)
    }

    fn pending_times(&self, task_type: &str) -> Result<Vec<Timestamp>, SchedulerError> {
        Ok(self
            .list_pending(TaskFilter::pending().with_type(task_type))?
            .into_iter()
            .map(|t| t.scheduled_for)
            .collect())
    }
}

/// JSON enqueue request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Task type.
    pub task_type: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Earliest execution time (ms since epoch).
    #[serde(default)]
    pub scheduled_for: Option<Timestamp>,
    /// Priority.
    #[serde(default)]
    pub priority: i32,
    /// Attempt ceiling.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Owning user.
    #[serde(default)]
    pub owner: Option<UserId>,
    /// Dedupe key; makes the submission idempotent while the task is live.
    #[serde(default)]
    pub dedupe_key: Option<String>,
}

impl From<EnqueueRequest> for NewTask {
    fn from(req: EnqueueRequest) -> Self {
        Self {
            task_type: req.task_type,
            payload: req.payload,
            scheduled_for: req.scheduled_for,
            priority: req.priority,
            max_attempts: req.max_attempts,
            owner: req.owner,
            dedupe_key: req.dedupe_key,
        }
    }
}

/// Task status response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    /// Task identifier.
    pub task_id: TaskId,
    /// Task type.
    pub task_type: String,
    /// Current status.
    pub status: TaskStatus,
    /// Tries consumed.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Next eligible time.
    pub scheduled_for: Timestamp,
    /// Most recent failure.
    pub reason: Option<String>,
}

impl From<&Task> for TaskStatusResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            status: task.status,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            scheduled_for: task.scheduled_for,
            reason: task.last_error.clone(),
        }
    }
}

/// Health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    /// Store reachable.
    pub ok: bool,
    /// Pending tasks when reachable.
    pub pending: Option<usize>,
}

/// Submit a JSON request. Returns `None` when a dedupe key suppressed it.
///
/// # Errors
///
/// As for [`Producer::enqueue_task`].
pub fn submit(producer: &Producer, req: EnqueueRequest) -> Result<Option<TaskId>, SchedulerError> {
    if req.dedupe_key.is_some() {
        producer.enqueue_unique(req.into())
    } else {
        producer.enqueue_task(req.into()).map(Some)
    }
}

/// Probe the store behind `producer`.
pub fn health(producer: &Producer) -> Health {
    match producer.list_pending(TaskFilter::pending()) {
        Ok(pending) => Health {
            ok: true,
            pending: Some(pending.len()),
        },
        Err(_) => Health {
            ok: false,
            pending: None,
        },
    }
}
