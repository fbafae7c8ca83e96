//! In-memory scheduling state shared by the memory and file backends.
//!
//! `StoreState` holds every task, usage record and rate event and implements
//! each store and ledger operation as a plain `&mut self` transition. Callers
//! provide mutual exclusion: a mutex for [`MemoryStore`](super::MemoryStore),
//! an OS file lock for [`FileStore`](super::FileStore).

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::ledger::{retry_after, RateDecision, UsageCharge, UsageDecision, UsageRecord};
use crate::core::store::{
    require_dedupe_key, require_owner, Completion, Failure, DEFAULT_MAX_ATTEMPTS, QUOTA_EXCEEDED_ERROR,
    WORKER_LOST_ERROR,
};
use crate::core::task::{NewTask, Task, TaskFilter, TaskStatus};
use crate::core::SchedulerError;
use crate::util::clock::duration_ms;
use crate::util::serde::{TaskId, Timestamp, UserId};

/// Complete scheduling state of a single-writer backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreState {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, Task>,
    #[serde(default)]
    usage: BTreeMap<UserId, BTreeMap<String, UsageRecord>>,
    #[serde(default)]
    rate_events: BTreeMap<UserId, BTreeMap<String, Vec<Timestamp>>>,
}

impl StoreState {
    /// Number of task rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no task rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn insert(&mut self, task: NewTask, now: Timestamp) -> Result<TaskId, SchedulerError> {
        task.validate().map_err(SchedulerError::Validation)?;
        self.next_id += 1;
        let id = self.next_id;
        self.tasks.insert(id, task.into_task(id, now, DEFAULT_MAX_ATTEMPTS));
        Ok(id)
    }

    pub(crate) fn insert_unique(
        &mut self,
        task: NewTask,
        now: Timestamp,
    ) -> Result<Option<TaskId>, SchedulerError> {
        require_dedupe_key(&task)?;
        let duplicate = self.tasks.values().any(|t| {
            matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
                && t.task_type == task.task_type
                && t.dedupe_key == task.dedupe_key
        });
        if duplicate {
            return Ok(None);
        }
        self.insert(task, now).map(Some)
    }

    pub(crate) fn claim_next(&mut self, worker_id: &str, now: Timestamp) -> Option<Task> {
        let id = self
            .tasks
            .values()
            .filter(|t| t.is_eligible(now))
            .max_by_key(|t| t.claim_key())
            .map(|t| t.id)?;
        let task = self.tasks.get_mut(&id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.claimed_by = Some(worker_id.to_string());
        Some(task.clone())
    }

    pub(crate) fn complete(
        &mut self,
        id: TaskId,
        worker_id: &str,
        charge: Option<&UsageCharge>,
        now: Timestamp,
    ) -> Result<Completion, SchedulerError> {
        let task = self.tasks.get(&id).ok_or(SchedulerError::NotFound(id))?;
        match task.status {
            TaskStatus::Running => require_owner(task, worker_id)?,
            TaskStatus::Completed => return Ok(Completion::AlreadyCompleted(task.clone())),
            TaskStatus::Pending => return Err(SchedulerError::NotRunning(id)),
            status @ (TaskStatus::Failed | TaskStatus::Cancelled) => {
                return Err(SchedulerError::AlreadyTerminal { id, status })
            }
        }

        let allowed = charge.is_none_or(|c| self.consume_usage(&c.user, &c.period).is_allowed());
        let task = self.tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        task.completed_at = Some(now);
        task.claimed_by = None;
        if allowed {
            task.status = TaskStatus::Completed;
            Ok(Completion::Completed(task.clone()))
        } else {
            task.status = TaskStatus::Failed;
            task.last_error = Some(QUOTA_EXCEEDED_ERROR.to_string());
            Ok(Completion::QuotaDenied(task.clone()))
        }
    }

    pub(crate) fn fail(
        &mut self,
        id: TaskId,
        worker_id: &str,
        failure: Failure,
        now: Timestamp,
    ) -> Result<Task, SchedulerError> {
        let task = self.tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        if task.status != TaskStatus::Running {
            return Err(SchedulerError::NotRunning(id));
        }
        require_owner(task, worker_id)?;
        apply_failure(task, failure, now);
        Ok(task.clone())
    }

    pub(crate) fn cancel(&mut self, id: TaskId, now: Timestamp) -> Result<Task, SchedulerError> {
        let task = self.pending_mut(id)?;
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now);
        Ok(task.clone())
    }

    pub(crate) fn reschedule(&mut self, id: TaskId, at: Timestamp) -> Result<Task, SchedulerError> {
        let task = self.pending_mut(id)?;
        task.scheduled_for = at;
        Ok(task.clone())
    }

    pub(crate) fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.tasks.get(&id).cloned().ok_or(SchedulerError::NotFound(id))
    }

    pub(crate) fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let mut rows: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        if filter.status == Some(TaskStatus::Pending) {
            rows.sort_by_key(|t| std::cmp::Reverse(t.claim_key()));
        }
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        rows
    }

    pub(crate) fn recover_stale(&mut self, started_before: Timestamp, now: Timestamp) -> Vec<Task> {
        self.tasks
            .values_mut()
            .filter(|t| {
                t.status == TaskStatus::Running && t.started_at.is_some_and(|s| s < started_before)
            })
            .map(|task| {
                let failure = Failure::Transient {
                    error: WORKER_LOST_ERROR.to_string(),
                    retry_at: now,
                };
                apply_failure(task, failure, now);
                task.clone()
            })
            .collect()
    }

    pub(crate) fn check_and_record(
        &mut self,
        user: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> RateDecision {
        let window_ms = duration_ms(window);
        let events = self
            .rate_events
            .entry(user.to_string())
            .or_default()
            .entry(action.to_string())
            .or_default();
        let cutoff = now.saturating_sub(window_ms);
        events.retain(|&t| t > cutoff);

        let used = u32::try_from(events.len()).unwrap_or(u32::MAX);
        if used < limit {
            events.push(now);
            RateDecision::Allowed {
                remaining: limit - used - 1,
            }
        } else {
            let oldest = events.iter().copied().min().unwrap_or(now);
            RateDecision::Denied {
                retry_after_ms: retry_after(oldest, window_ms, now),
            }
        }
    }

    pub(crate) fn prune_rate_windows(&mut self, older_than: Timestamp) -> usize {
        let mut pruned = 0;
        for actions in self.rate_events.values_mut() {
            for events in actions.values_mut() {
                let before = events.len();
                events.retain(|&t| t >= older_than);
                pruned += before - events.len();
            }
            actions.retain(|_, events| !events.is_empty());
        }
        self.rate_events.retain(|_, actions| !actions.is_empty());
        pruned
    }

    pub(crate) fn set_usage_limit(&mut self, user: &str, period: &str, posts_limit: u32) -> UsageRecord {
        let record = self
            .usage
            .entry(user.to_string())
            .or_default()
            .entry(period.to_string())
            .or_insert_with(|| UsageRecord {
                user: user.to_string(),
                period: period.to_string(),
                posts_used: 0,
                posts_limit,
            });
        record.posts_limit = posts_limit;
        record.clone()
    }

    pub(crate) fn consume_usage(&mut self, user: &str, period: &str) -> UsageDecision {
        let Some(record) = self.usage.get_mut(user).and_then(|p| p.get_mut(period)) else {
            return UsageDecision::NoPlan;
        };
        if record.posts_used < record.posts_limit {
            record.posts_used += 1;
            UsageDecision::Allowed(record.clone())
        } else {
            UsageDecision::Denied(record.clone())
        }
    }

    pub(crate) fn usage(&self, user: &str, period: &str) -> Option<UsageRecord> {
        self.usage.get(user).and_then(|p| p.get(period)).cloned()
    }

    fn pending_mut(&mut self, id: TaskId) -> Result<&mut Task, SchedulerError> {
        let task = self.tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        match task.status {
            TaskStatus::Pending => Ok(task),
            TaskStatus::Running => Err(SchedulerError::AlreadyRunning(id)),
            status => Err(SchedulerError::AlreadyTerminal { id, status }),
        }
    }
}

/// Record a failed try on a running task.
pub(crate) fn apply_failure(task: &mut Task, failure: Failure, now: Timestamp) {
    task.claimed_by = None;
    match failure {
        Failure::Transient { error, retry_at } => {
            task.attempts = task.attempts.saturating_add(1);
            task.last_error = Some(error);
            if task.attempts >= task.max_attempts {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(now);
            } else {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.scheduled_for = task.scheduled_for.max(retry_at);
            }
        }
        Failure::Permanent { error } => {
            task.status = TaskStatus::Failed;
            task.last_error = Some(error);
            task.completed_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(kind: &str) -> NewTask {
        NewTask::new(kind, json!({}))
    }

    #[test]
    fn claim_honors_priority_then_time_then_id() {
        let mut state = StoreState::default();
        let low_early = state.insert(task("a").scheduled_for(90), 0).unwrap();
        let high = state.insert(task("a").priority(5).scheduled_for(100), 0).unwrap();
        let low_early_twin = state.insert(task("a").scheduled_for(90), 0).unwrap();

        assert_eq!(state.claim_next("w", 100).unwrap().id, high);
        assert_eq!(state.claim_next("w", 100).unwrap().id, low_early);
        assert_eq!(state.claim_next("w", 100).unwrap().id, low_early_twin);
        assert!(state.claim_next("w", 100).is_none());
    }

    #[test]
    fn future_tasks_are_not_claimed() {
        let mut state = StoreState::default();
        state.insert(task("a").scheduled_for(500), 0).unwrap();
        assert!(state.claim_next("w", 499).is_none());
        assert!(state.claim_next("w", 500).is_some());
    }

    #[test]
    fn transient_failures_requeue_until_ceiling() {
        let mut state = StoreState::default();
        let id = state.insert(task("a").max_attempts(2), 0).unwrap();

        state.claim_next("w", 0).unwrap();
        let retried = state
            .fail(id, "w", Failure::Transient { error: "timeout".into(), retry_at: 60 }, 1)
            .unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.scheduled_for, 60);
        assert!(retried.claimed_by.is_none());

        state.claim_next("w", 60).unwrap();
        let failed = state
            .fail(id, "w", Failure::Transient { error: "timeout".into(), retry_at: 180 }, 61)
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempts, 2);
        assert!(state.claim_next("w", 1_000).is_none());
    }

    #[test]
    fn retry_never_moves_schedule_backwards() {
        let mut state = StoreState::default();
        let id = state.insert(task("a"), 100).unwrap();
        state.claim_next("w", 100).unwrap();
        let retried = state
            .fail(id, "w", Failure::Transient { error: "x".into(), retry_at: 50 }, 100)
            .unwrap();
        assert_eq!(retried.scheduled_for, 100);
    }

    #[test]
    fn permanent_failure_keeps_attempts() {
        let mut state = StoreState::default();
        let id = state.insert(task("a"), 0).unwrap();
        state.claim_next("w", 0).unwrap();
        let failed = state.fail(id, "w", Failure::Permanent { error: "bad".into() }, 1).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempts, 0);
    }

    #[test]
    fn fail_requires_running() {
        let mut state = StoreState::default();
        let id = state.insert(task("a"), 0).unwrap();
        let err = state.fail(id, "w", Failure::Permanent { error: "x".into() }, 0).unwrap_err();
        assert!(matches!(err, SchedulerError::NotRunning(_)));
    }

    #[test]
    fn reports_from_other_workers_are_rejected() {
        let mut state = StoreState::default();
        let id = state.insert(task("a"), 0).unwrap();
        state.claim_next("w2", 0).unwrap();
        let err = state.fail(id, "w1", Failure::Permanent { error: "x".into() }, 1).unwrap_err();
        assert!(matches!(err, SchedulerError::NotOwner { owner: Some(_), .. }));
        assert!(matches!(
            state.complete(id, "w1", None, 1),
            Err(SchedulerError::NotOwner { .. })
        ));
        assert_eq!(state.get(id).unwrap().status, TaskStatus::Running);
        assert!(matches!(
            state.complete(id, "w2", None, 1).unwrap(),
            Completion::Completed(_)
        ));
    }

    #[test]
    fn completion_is_idempotent_and_charges_once() {
        let mut state = StoreState::default();
        state.set_usage_limit("u1", "2026-10", 5);
        let id = state.insert(task("publish"), 0).unwrap();
        state.claim_next("w", 0).unwrap();
        let charge = UsageCharge::new("u1", "2026-10");

        assert!(matches!(
            state.complete(id, "w", Some(&charge), 1).unwrap(),
            Completion::Completed(_)
        ));
        let done = state.get(id).unwrap();
        assert_eq!(
            state.complete(id, "w", Some(&charge), 2).unwrap(),
            Completion::AlreadyCompleted(done)
        );
        assert_eq!(state.usage("u1", "2026-10").unwrap().posts_used, 1);
    }

    #[test]
    fn quota_denial_fails_the_task() {
        let mut state = StoreState::default();
        state.set_usage_limit("u1", "2026-10", 0);
        let id = state.insert(task("publish"), 0).unwrap();
        state.claim_next("w", 0).unwrap();
        let charge = UsageCharge::new("u1", "2026-10");

        let Completion::QuotaDenied(task) = state.complete(id, "w", Some(&charge), 1).unwrap() else {
            panic!("expected quota denial");
        };
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_error.as_deref(), Some(QUOTA_EXCEEDED_ERROR));
        assert_eq!(state.usage("u1", "2026-10").unwrap().posts_used, 0);
    }

    #[test]
    fn missing_plan_denies_charged_completion() {
        let mut state = StoreState::default();
        let id = state.insert(task("publish"), 0).unwrap();
        state.claim_next("w", 0).unwrap();
        let charge = UsageCharge::new("nobody", "2026-10");
        assert!(matches!(
            state.complete(id, "w", Some(&charge), 1).unwrap(),
            Completion::QuotaDenied(_)
        ));
    }

    #[test]
    fn completing_terminal_or_pending_tasks_errors() {
        let mut state = StoreState::default();
        let pending = state.insert(task("a"), 0).unwrap();
        assert!(matches!(
            state.complete(pending, "w", None, 0),
            Err(SchedulerError::NotRunning(_))
        ));
        state.cancel(pending, 0).unwrap();
        assert!(matches!(
            state.complete(pending, "w", None, 0),
            Err(SchedulerError::AlreadyTerminal { status: TaskStatus::Cancelled, .. })
        ));
    }

    #[test]
    fn cancel_and_reschedule_only_while_pending() {
        let mut state = StoreState::default();
        let id = state.insert(task("a"), 0).unwrap();
        assert_eq!(state.reschedule(id, 500).unwrap().scheduled_for, 500);
        state.claim_next("w", 500).unwrap();
        assert!(matches!(state.cancel(id, 501), Err(SchedulerError::AlreadyRunning(_))));
        assert!(matches!(state.reschedule(id, 900), Err(SchedulerError::AlreadyRunning(_))));
        assert!(matches!(state.cancel(404, 0), Err(SchedulerError::NotFound(404))));
    }

    #[test]
    fn unique_insert_suppresses_live_duplicates_only() {
        let mut state = StoreState::default();
        let first = state.insert_unique(task("remind").dedupe_key("post:1"), 0).unwrap();
        assert!(first.is_some());
        assert!(state.insert_unique(task("remind").dedupe_key("post:1"), 0).unwrap().is_none());
        assert!(state.insert_unique(task("other").dedupe_key("post:1"), 0).unwrap().is_some());

        let id = first.unwrap();
        state.cancel(id, 1).unwrap();
        assert!(state.insert_unique(task("remind").dedupe_key("post:1"), 2).unwrap().is_some());
        assert!(matches!(
            state.insert_unique(task("remind"), 0),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn stale_running_tasks_are_released() {
        let mut state = StoreState::default();
        let id = state.insert(task("a"), 0).unwrap();
        state.claim_next("w", 10).unwrap();
        assert!(state.recover_stale(5, 100).is_empty());
        let recovered = state.recover_stale(20, 100);
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, id);
        assert_eq!(recovered[0].status, TaskStatus::Pending);
        assert_eq!(recovered[0].attempts, 1);
        assert_eq!(recovered[0].last_error.as_deref(), Some(WORKER_LOST_ERROR));
    }

    #[test]
    fn sliding_window_admits_again_after_expiry() {
        let mut state = StoreState::default();
        let window = Duration::from_secs(60);
        for i in 0..10 {
            assert!(state.check_and_record("u", "post", 10, window, 1_000 + i).is_allowed());
        }
        assert_eq!(
            state.check_and_record("u", "post", 10, window, 2_000),
            RateDecision::Denied { retry_after_ms: 59_000 }
        );
        assert!(state.check_and_record("u", "post", 10, window, 61_000).is_allowed());
        assert!(state.check_and_record("other", "post", 10, window, 2_000).is_allowed());
    }

    #[test]
    fn pruning_drops_old_events() {
        let mut state = StoreState::default();
        let window = Duration::from_secs(3600);
        state.check_and_record("u", "post", 10, window, 100);
        state.check_and_record("u", "post", 10, window, 200);
        state.check_and_record("v", "post", 10, window, 300);
        assert_eq!(state.prune_rate_windows(250), 2);
        assert_eq!(state.prune_rate_windows(250), 0);
    }

    #[test]
    fn list_pending_in_claim_order() {
        let mut state = StoreState::default();
        let a = state.insert(task("a"), 0).unwrap();
        let b = state.insert(task("a").priority(3), 0).unwrap();
        let ids: Vec<_> = state.list(&TaskFilter::pending()).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b, a]);
        assert_eq!(state.list(&TaskFilter::default().with_limit(1))[0].id, a);
    }
}
