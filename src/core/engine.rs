//! Claim and execution engine.
//!
//! One call to [`ExecutionEngine::run_once`] claims at most one due task,
//! dispatches it to its handler, and records the outcome. Handler failures
//! never escape: they become `last_error` plus a status transition.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::core::audit::{AuditAction, AuditEvent, AuditSink};
use crate::core::handler::{
    FailureCategory, HandlerContext, HandlerError, HandlerOutcome, HandlerRegistry, TaskHandler,
};
use crate::core::ledger::UsageCharge;
use crate::core::retry::RetryPolicies;
use crate::core::store::{Backend, Completion, Failure};
use crate::core::task::{NewTask, Task, TaskStatus};
use crate::core::wake::WakeChannel;
use crate::core::SchedulerError;
use crate::util::clock::{duration_ms, Clock};
use crate::util::serde::{TaskId, Timestamp, UserId};

/// Task type of best-effort user notifications.
pub const NOTIFY_USER_TASK: &str = "notify_user";

/// Payload of a [`NOTIFY_USER_TASK`] task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNotification {
    /// Recipient.
    pub user: UserId,
    /// Task that failed.
    pub task_id: TaskId,
    /// Type of the failed task.
    pub task_type: String,
    /// Categorized reason.
    pub category: FailureCategory,
    /// Human-readable summary.
    pub message: String,
}

/// Retry settings for store calls made after a handler has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetry {
    /// Total tries per store call.
    pub attempts: u32,
    /// Pause between tries.
    pub delay: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Completed by this run.
    Completed,
    /// Was already completed; nothing changed.
    AlreadyCompleted,
    /// Re-queued after a transient failure.
    Retrying {
        /// Next eligible time.
        retry_at: Timestamp,
    },
    /// Terminally failed.
    Failed {
        /// Categorized reason.
        category: FailureCategory,
    },
    /// The claim was released before the outcome could be recorded; the
    /// outcome was dropped and the store left untouched.
    Superseded,
}

/// Summary of one claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Task identifier.
    pub task_id: TaskId,
    /// Task type.
    pub task_type: String,
    /// Worker that ran it.
    pub worker_id: String,
    /// Failed tries after this run.
    pub attempts: u32,
    /// Outcome.
    pub disposition: Disposition,
}

/// Claims, dispatches, and records outcomes.
pub struct ExecutionEngine {
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    policies: Arc<RetryPolicies>,
    clock: Arc<dyn Clock>,
    store_retry: StoreRetry,
    wake: Option<Arc<dyn WakeChannel>>,
    audit: Option<Arc<Mutex<Box<dyn AuditSink>>>>,
}

impl ExecutionEngine {
    /// Create an engine from its collaborators.
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: HandlerRegistry,
        policies: RetryPolicies,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            registry: Arc::new(registry),
            policies: Arc::new(policies),
            clock,
            store_retry: StoreRetry::default(),
            wake: None,
            audit: None,
        }
    }

    /// Override store retry settings.
    #[must_use]
    pub const fn with_store_retry(mut self, store_retry: StoreRetry) -> Self {
        self.store_retry = store_retry;
        self
    }

    /// Signal this channel when the engine enqueues follow-up work.
    #[must_use]
    pub fn with_wake(mut self, wake: Arc<dyn WakeChannel>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Arc::new(Mutex::new(audit)));
        self
    }

    /// Registered handlers.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Claim and run at most one due task.
    ///
    /// Returns `Ok(None)` when nothing is due. If stale recovery released the
    /// claim while the handler ran, the outcome is dropped and reported as
    /// [`Disposition::Superseded`].
    ///
    /// # Errors
    ///
    /// Store errors from the claim (nothing was mutated) or from recording the
    /// outcome after store retries are exhausted (the task stays `running`
    /// until stale recovery releases it).
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<RunReport>, SchedulerError> {
        let now = self.clock.now_ms();
        let Some(task) = self.backend.claim_next(worker_id, now)? else {
            debug!(worker = worker_id, "no due task");
            return Ok(None);
        };
        info!(
            worker = worker_id,
            task_id = task.id,
            task_type = %task.task_type,
            attempt = task.attempts + 1,
            "claimed task"
        );
        self.audit(AuditEvent::new(&task, AuditAction::Claimed, now));

        let outcome = match self.registry.get(&task.task_type) {
            Some(handler) => self.dispatch(&task, worker_id, handler).await,
            None => self.fail_unregistered(&task, worker_id).await,
        };
        match outcome {
            Ok(report) => Ok(Some(report)),
            Err(
                e @ (SchedulerError::NotOwner { .. }
                | SchedulerError::NotRunning(_)
                | SchedulerError::AlreadyTerminal { .. }),
            ) => {
                warn!(
                    worker = worker_id,
                    task_id = task.id,
                    "claim lost before the outcome was recorded, dropping it: {e}"
                );
                Ok(Some(report(&task, worker_id, Disposition::Superseded)))
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(
        &self,
        task: &Task,
        worker_id: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<RunReport, SchedulerError> {
        let ctx = HandlerContext::new(
            task.clone(),
            worker_id,
            Arc::clone(&self.backend),
            Arc::clone(&self.clock),
        );
        // Run on its own task so a panicking handler cannot take the worker down.
        let result = match tokio::spawn(async move { handler.handle(ctx).await }).await {
            Ok(result) => result,
            Err(join) => Err(HandlerError::transient(format!("handler aborted: {join}"))),
        };

        match result {
            Ok(HandlerOutcome::Done) => self.complete(task, worker_id, None).await,
            Ok(HandlerOutcome::DoneConsuming(charge)) => {
                self.complete(task, worker_id, Some(charge)).await
            }
            Err(HandlerError::Transient(detail)) => {
                self.fail_transient(task, worker_id, detail).await
            }
            Err(HandlerError::Permanent { category, detail }) => {
                self.fail_permanent(task, worker_id, category, detail).await
            }
        }
    }

    async fn complete(
        &self,
        task: &Task,
        worker_id: &str,
        charge: Option<UsageCharge>,
    ) -> Result<RunReport, SchedulerError> {
        let completion = self
            .retry_store(task.id, |now| {
                self.backend.complete(task.id, worker_id, charge.as_ref(), now)
            })
            .await?;
        let now = self.clock.now_ms();
        let (done, disposition) = match completion {
            Completion::Completed(done) => {
                info!(worker = worker_id, task_id = done.id, "task completed");
                self.audit(AuditEvent::new(&done, AuditAction::Completed, now).worker(worker_id));
                (done, Disposition::Completed)
            }
            Completion::AlreadyCompleted(done) => {
                debug!(task_id = done.id, "task was already completed");
                (done, Disposition::AlreadyCompleted)
            }
            Completion::QuotaDenied(failed) => {
                warn!(
                    worker = worker_id,
                    task_id = failed.id,
                    owner = failed.owner.as_deref().unwrap_or("-"),
                    "quota exhausted at completion"
                );
                self.audit(
                    AuditEvent::new(&failed, AuditAction::QuotaDenied, now).worker(worker_id),
                );
                self.notify_owner(&failed, FailureCategory::QuotaExceeded).await;
                let category = FailureCategory::QuotaExceeded;
                (failed, Disposition::Failed { category })
            }
        };
        Ok(report(&done, worker_id, disposition))
    }

    async fn fail_transient(
        &self,
        task: &Task,
        worker_id: &str,
        detail: String,
    ) -> Result<RunReport, SchedulerError> {
        let policy = self.policies.for_type(&task.task_type);
        let delay = duration_ms(policy.next_schedule(task.attempts + 1));
        let updated = self
            .retry_store(task.id, |now| {
                self.backend.fail(
                    task.id,
                    worker_id,
                    Failure::Transient {
                        error: detail.clone(),
                        retry_at: now.saturating_add(delay),
                    },
                    now,
                )
            })
            .await?;
        let now = self.clock.now_ms();

        if updated.status == TaskStatus::Failed {
            warn!(
                worker = worker_id,
                task_id = updated.id,
                attempts = updated.attempts,
                error = %detail,
                "task failed permanently after exhausting retries"
            );
            self.audit(
                AuditEvent::new(&updated, AuditAction::Failed, now)
                    .worker(worker_id)
                    .detail(detail),
            );
            let category = FailureCategory::RetriesExhausted;
            self.notify_owner(&updated, category).await;
            return Ok(report(&updated, worker_id, Disposition::Failed { category }));
        }

        warn!(
            worker = worker_id,
            task_id = updated.id,
            attempts = updated.attempts,
            retry_at = updated.scheduled_for,
            error = %detail,
            "task failed, will retry"
        );
        self.audit(
            AuditEvent::new(&updated, AuditAction::Retried, now)
                .worker(worker_id)
                .detail(detail),
        );
        let retry_at = updated.scheduled_for;
        Ok(report(&updated, worker_id, Disposition::Retrying { retry_at }))
    }

    async fn fail_permanent(
        &self,
        task: &Task,
        worker_id: &str,
        category: FailureCategory,
        detail: String,
    ) -> Result<RunReport, SchedulerError> {
        let error = format!("{category}: {detail}");
        let failed = self
            .retry_store(task.id, |now| {
                self.backend
                    .fail(task.id, worker_id, Failure::Permanent { error: error.clone() }, now)
            })
            .await?;
        warn!(worker = worker_id, task_id = failed.id, %category, error = %detail, "task failed permanently");
        self.audit(
            AuditEvent::new(&failed, AuditAction::Failed, self.clock.now_ms())
                .worker(worker_id)
                .detail(error),
        );
        self.notify_owner(&failed, category).await;
        Ok(report(&failed, worker_id, Disposition::Failed { category }))
    }

    async fn fail_unregistered(&self, task: &Task, worker_id: &str) -> Result<RunReport, SchedulerError> {
        let error = format!("no handler registered for task type `{}`", task.task_type);
        error!(
            target: "work_queue::alert",
            worker = worker_id,
            task_id = task.id,
            task_type = %task.task_type,
            "{error}"
        );
        let failed = self
            .retry_store(task.id, |now| {
                self.backend
                    .fail(task.id, worker_id, Failure::Permanent { error: error.clone() }, now)
            })
            .await?;
        self.audit(
            AuditEvent::new(&failed, AuditAction::Alert, self.clock.now_ms())
                .worker(worker_id)
                .detail(error),
        );
        let category = FailureCategory::Misconfigured;
        self.notify_owner(&failed, category).await;
        Ok(report(&failed, worker_id, Disposition::Failed { category }))
    }

    /// Enqueue a user notification for a terminally failed task. Failures
    /// here are logged and swallowed.
    async fn notify_owner(&self, task: &Task, category: FailureCategory) {
        let Some(request) = owner_notification(task, category, &self.policies) else {
            return;
        };
        match self
            .retry_store(task.id, |now| self.backend.insert(request.clone(), now))
            .await
        {
            Ok(id) => {
                debug!(task_id = task.id, notification_id = id, "queued user notification");
                if let Some(wake) = &self.wake {
                    wake.notify();
                }
            }
            Err(e) => warn!(task_id = task.id, "could not queue user notification: {e}"),
        }
    }

    async fn retry_store<T, F>(&self, task_id: TaskId, mut op: F) -> Result<T, SchedulerError>
    where
        F: FnMut(Timestamp) -> Result<T, SchedulerError>,
    {
        let attempts = self.store_retry.attempts.max(1);
        let mut tried = 0;
        loop {
            tried += 1;
            match op(self.clock.now_ms()) {
                Err(e) if e.is_retryable() && tried < attempts => {
                    warn!(task_id, tried, "store unavailable, retrying: {e}");
                    tokio::time::sleep(self.store_retry.delay).await;
                }
                Err(e) if e.is_retryable() => {
                    error!(
                        target: "work_queue::alert",
                        task_id,
                        "store unavailable after {tried} tries; task left for stale recovery: {e}"
                    );
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.lock().record(event);
        }
    }
}

/// Notification request for the owner of a terminally failed task, or `None`
/// when there is nobody to tell.
pub(crate) fn owner_notification(
    task: &Task,
    category: FailureCategory,
    policies: &RetryPolicies,
) -> Option<NewTask> {
    let user = task.owner.clone()?;
    if task.task_type == NOTIFY_USER_TASK {
        return None;
    }
    let notification = UserNotification {
        user: user.clone(),
        task_id: task.id,
        task_type: task.task_type.clone(),
        category,
        message: category.user_message().to_string(),
    };
    let payload = match serde_json::to_value(&notification) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(task_id = task.id, "could not encode user notification: {e}");
            return None;
        }
    };
    let max_attempts = policies.for_type(NOTIFY_USER_TASK).max_attempts;
    Some(
        NewTask::new(NOTIFY_USER_TASK, payload)
            .owner(user)
            .max_attempts(max_attempts),
    )
}

fn report(task: &Task, worker_id: &str, disposition: Disposition) -> RunReport {
    RunReport {
        task_id: task.id,
        task_type: task.task_type.clone(),
        worker_id: worker_id.to_string(),
        attempts: task.attempts,
        disposition,
    }
}
