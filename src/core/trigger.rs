//! Periodic trigger.
//!
//! A periodic job scans domain state and reports what is due. The trigger
//! enqueues each item through `insert_unique`, so a second scan that sees the
//! same entity while its task is still pending or running adds nothing. The
//! trigger keeps no memory between runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::core::error::AppResult;
use crate::core::retry::RetryPolicies;
use crate::core::store::Backend;
use crate::core::task::NewTask;
use crate::core::wake::WakeChannel;
use crate::util::clock::Clock;
use crate::util::serde::{Timestamp, UserId};

/// Something a periodic scan found due.
#[derive(Debug, Clone, PartialEq)]
pub struct DueItem {
    /// Task type to enqueue.
    pub task_type: String,
    /// Identity of the domain entity (e.g. `post:42`).
    pub dedupe_key: String,
    /// Handler payload.
    pub payload: serde_json::Value,
    /// Owning user.
    pub owner: Option<UserId>,
    /// Priority.
    pub priority: i32,
    /// Earliest run time; `None` means now.
    pub scheduled_for: Option<Timestamp>,
}

impl DueItem {
    /// Item for `task_type` keyed by `dedupe_key`.
    pub fn new(
        task_type: impl Into<String>,
        dedupe_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_type: task_type.into(),
            dedupe_key: dedupe_key.into(),
            payload,
            owner: None,
            priority: 0,
            scheduled_for: None,
        }
    }

    /// Attach the owning user.
    #[must_use]
    pub fn owner(mut self, owner: impl Into<UserId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Defer until `at`.
    #[must_use]
    pub const fn scheduled_for(mut self, at: Timestamp) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    fn into_new_task(self) -> NewTask {
        let mut task = NewTask::new(self.task_type, self.payload)
            .priority(self.priority)
            .dedupe_key(self.dedupe_key);
        task.owner = self.owner;
        task.scheduled_for = self.scheduled_for;
        task
    }
}

/// Domain scan run on a cadence.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Items due at `now`.
    async fn scan(&self, now: Timestamp) -> AppResult<Vec<DueItem>>;
}

/// A named job and how often it runs.
#[derive(Clone)]
pub struct ScheduleDefinition {
    /// Name used in logs.
    pub name: String,
    /// Interval between runs.
    pub cadence: Duration,
    /// The scan.
    pub job: Arc<dyn PeriodicJob>,
}

impl ScheduleDefinition {
    /// Definition running `job` every `cadence`.
    pub fn new(name: impl Into<String>, cadence: Duration, job: Arc<dyn PeriodicJob>) -> Self {
        Self {
            name: name.into(),
            cadence,
            job,
        }
    }
}

/// Outcome of one trigger run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerReport {
    /// New tasks inserted.
    pub enqueued: usize,
    /// Items suppressed because an equivalent task was pending or running.
    pub skipped: usize,
}

/// Runs periodic jobs against a backend.
#[derive(Clone)]
pub struct PeriodicTrigger {
    backend: Arc<dyn Backend>,
    wake: Arc<dyn WakeChannel>,
    clock: Arc<dyn Clock>,
    policies: Arc<RetryPolicies>,
}

impl PeriodicTrigger {
    /// Trigger writing to `backend` and signalling `wake`.
    pub fn new(backend: Arc<dyn Backend>, wake: Arc<dyn WakeChannel>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            wake,
            clock,
            policies: Arc::new(RetryPolicies::default()),
        }
    }

    /// Take each item's attempt ceiling from its type's policy in `policies`.
    #[must_use]
    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    /// Scan once and enqueue everything new.
    ///
    /// # Errors
    ///
    /// Propagates the scan error or the first store error; items enqueued
    /// before the error stay enqueued.
    pub async fn run_job_once(&self, job: &dyn PeriodicJob) -> AppResult<TriggerReport> {
        let now = self.clock.now_ms();
        let items = job.scan(now).await?;
        let mut report = TriggerReport::default();
        for item in items {
            let max_attempts = self.policies.for_type(&item.task_type).max_attempts;
            let task = item.into_new_task().max_attempts(max_attempts);
            match self.backend.insert_unique(task, now)? {
                Some(id) => {
                    debug!(task_id = id, "periodic item enqueued");
                    report.enqueued += 1;
                }
                None => report.skipped += 1,
            }
        }
        if report.enqueued > 0 {
            self.wake.notify();
        }
        Ok(report)
    }

    /// Run `definition` on its cadence until `shutdown` turns `true`.
    pub fn spawn(
        &self,
        definition: ScheduleDefinition,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let trigger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(definition.cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = %definition.name, cadence = ?definition.cadence, "periodic job started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        match trigger.run_job_once(definition.job.as_ref()).await {
                            Ok(report) if report.enqueued > 0 => info!(
                                job = %definition.name,
                                enqueued = report.enqueued,
                                skipped = report.skipped,
                                "periodic job enqueued work"
                            ),
                            Ok(report) => debug!(job = %definition.name, skipped = report.skipped, "periodic job idle"),
                            Err(e) => error!(job = %definition.name, "periodic job failed: {e:#}"),
                        }
                    }
                }
            }
            info!(job = %definition.name, "periodic job stopped");
        })
    }
}
