//! In-memory backend for tests, development, and single-process embedding.
//!
//! Every operation takes one `parking_lot::Mutex`, so a claim and the write
//! that marks the task running are a single critical section.

use std::time::Duration;

use parking_lot::Mutex;

use crate::core::ledger::{Ledger, RateDecision, UsageCharge, UsageDecision, UsageRecord};
use crate::core::store::{Completion, Failure, TaskStore};
use crate::core::task::{NewTask, Task, TaskFilter};
use crate::core::SchedulerError;
use crate::infra::state::StoreState;
use crate::util::serde::{TaskId, Timestamp};

/// Volatile backend; state is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with `state`.
    #[must_use]
    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> StoreState {
        self.state.lock().clone()
    }
}

impl TaskStore for MemoryStore {
    fn insert(&self, task: NewTask, now: Timestamp) -> Result<TaskId, SchedulerError> {
        self.state.lock().insert(task, now)
    }

    fn insert_unique(&self, task: NewTask, now: Timestamp) -> Result<Option<TaskId>, SchedulerError> {
        self.state.lock().insert_unique(task, now)
    }

    fn claim_next(&self, worker_id: &str, now: Timestamp) -> Result<Option<Task>, SchedulerError> {
        Ok(self.state.lock().claim_next(worker_id, now))
    }

    fn complete(
        &self,
        id: TaskId,
        worker_id: &str,
        charge: Option<&UsageCharge>,
        now: Timestamp,
    ) -> Result<Completion, SchedulerError> {
        self.state.lock().complete(id, worker_id, charge, now)
    }

    fn fail(
        &self,
        id: TaskId,
        worker_id: &str,
        failure: Failure,
        now: Timestamp,
    ) -> Result<Task, SchedulerError> {
        self.state.lock().fail(id, worker_id, failure, now)
    }

    fn cancel(&self, id: TaskId, now: Timestamp) -> Result<Task, SchedulerError> {
        self.state.lock().cancel(id, now)
    }

    fn reschedule(&self, id: TaskId, at: Timestamp) -> Result<Task, SchedulerError> {
        self.state.lock().reschedule(id, at)
    }

    fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.state.lock().get(id)
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.state.lock().list(filter))
    }

    fn recover_stale(
        &self,
        started_before: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Task>, SchedulerError> {
        Ok(self.state.lock().recover_stale(started_before, now))
    }
}

impl Ledger for MemoryStore {
    fn check_and_record(
        &self,
        user: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> Result<RateDecision, SchedulerError> {
        Ok(self
            .state
            .lock()
            .check_and_record(user, action, limit, window, now))
    }

    fn prune_rate_windows(&self, older_than: Timestamp) -> Result<usize, SchedulerError> {
        Ok(self.state.lock().prune_rate_windows(older_than))
    }

    fn set_usage_limit(
        &self,
        user: &str,
        period: &str,
        posts_limit: u32,
    ) -> Result<UsageRecord, SchedulerError> {
        Ok(self.state.lock().set_usage_limit(user, period, posts_limit))
    }

    fn check_and_consume_usage(&self, user: &str, period: &str) -> Result<UsageDecision, SchedulerError> {
        Ok(self.state.lock().consume_usage(user, period))
    }

    fn usage(&self, user: &str, period: &str) -> Result<Option<UsageRecord>, SchedulerError> {
        Ok(self.state.lock().usage(user, period))
    }
}
