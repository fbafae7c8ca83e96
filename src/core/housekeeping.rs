//! Housekeeping: release tasks held by vanished workers and prune old rate events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::audit::{AuditAction, AuditEvent, AuditSink};
use crate::core::engine::owner_notification;
use crate::core::handler::FailureCategory;
use crate::core::retry::RetryPolicies;
use crate::core::store::{Backend, WORKER_LOST_ERROR};
use crate::core::task::{Task, TaskStatus};
use crate::core::SchedulerError;
use crate::util::clock::{duration_ms, Clock};
use crate::util::serde::Timestamp;

/// Housekeeping cadence and thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HousekeepingSettings {
    /// Interval between runs.
    pub interval: Duration,
    /// A running task older than this is presumed orphaned.
    pub stale_after: Duration,
    /// Rate events older than this are dropped.
    pub rate_window_retention: Duration,
}

impl Default for HousekeepingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            stale_after: Duration::from_secs(15 * 60),
            rate_window_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Result of one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Running tasks released for retry or failed.
    pub recovered: usize,
    /// Rate events removed.
    pub pruned: usize,
}

/// Periodic maintenance over a backend.
#[derive(Clone)]
pub struct Housekeeper {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    settings: HousekeepingSettings,
    policies: Arc<RetryPolicies>,
    audit: Option<Arc<Mutex<Box<dyn AuditSink>>>>,
}

impl Housekeeper {
    /// Housekeeper for `backend`.
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, settings: HousekeepingSettings) -> Self {
        Self {
            backend,
            clock,
            settings,
            policies: Arc::new(RetryPolicies::default()),
            audit: None,
        }
    }

    /// Retry policies used for owner notifications.
    #[must_use]
    pub fn with_policies(mut self, policies: RetryPolicies) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    /// Attach an audit sink.
    #[must_use]
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(Arc::new(Mutex::new(audit)));
        self
    }

    /// One pass of stale recovery and rate pruning.
    ///
    /// # Errors
    ///
    /// Store errors; nothing is partially applied within one step.
    pub fn run_once(&self) -> Result<HousekeepingReport, SchedulerError> {
        let now = self.clock.now_ms();
        let started_before = now.saturating_sub(duration_ms(self.settings.stale_after));
        let recovered = self.backend.recover_stale(started_before, now)?;
        for task in &recovered {
            warn!(
                task_id = task.id,
                task_type = %task.task_type,
                status = %task.status,
                attempts = task.attempts,
                "released task from a lost worker"
            );
            self.record(AuditEvent::new(task, AuditAction::Recovered, now));
            if task.status == TaskStatus::Failed {
                self.escalate(task, now);
            }
        }
        let older_than = now.saturating_sub(duration_ms(self.settings.rate_window_retention));
        let pruned = self.backend.prune_rate_windows(older_than)?;
        debug!(recovered = recovered.len(), pruned, "housekeeping pass done");
        Ok(HousekeepingReport {
            recovered: recovered.len(),
            pruned,
        })
    }

    // A lost worker used up the last attempt.
    fn escalate(&self, task: &Task, now: Timestamp) {
        error!(
            target: "work_queue::alert",
            task_id = task.id,
            task_type = %task.task_type,
            attempts = task.attempts,
            "task failed permanently after its worker was lost"
        );
        self.record(
            AuditEvent::new(task, AuditAction::Alert, now).detail(WORKER_LOST_ERROR),
        );
        let Some(request) =
            owner_notification(task, FailureCategory::RetriesExhausted, &self.policies)
        else {
            return;
        };
        match self.backend.insert(request, now) {
            Ok(id) => debug!(task_id = task.id, notification_id = id, "queued user notification"),
            Err(e) => warn!(task_id = task.id, "could not queue user notification: {e}"),
        }
    }

    fn record(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit {
            sink.lock().record(event);
        }
    }

    /// Run on the configured interval until `shutdown` turns `true`.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let keeper = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keeper.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval = ?keeper.settings.interval, "housekeeper started");
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = keeper.run_once() {
                            error!("housekeeping failed: {e}");
                        }
                    }
                }
            }
            info!("housekeeper stopped");
        })
    }
}
