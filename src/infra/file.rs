//! Single-writer JSON file backend.
//!
//! The whole state lives in one JSON document. Every operation takes an
//! exclusive advisory lock on a sibling `.lock` file, reloads the document,
//! applies the transition, and atomically replaces the file (temp file plus
//! rename). Processes sharing the file therefore see the same claim guarantee
//! as the durable backends, at the cost of rewriting the document per write.
//!
//! Suited to small single-host deployments. Do not point a SQLite-backed
//! deployment and a file-backed one at the same workload.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::core::ledger::{Ledger, RateDecision, UsageCharge, UsageDecision, UsageRecord};
use crate::core::store::{Completion, Failure, TaskStore};
use crate::core::task::{NewTask, Task, TaskFilter};
use crate::core::SchedulerError;
use crate::infra::state::StoreState;
use crate::util::serde::{TaskId, Timestamp};

/// JSON-document backend guarded by an OS file lock.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the parent directory cannot be created, or
    /// `Backend` if an existing file is not a valid document.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let store = Self {
            path,
            lock_path: lock_path.into(),
        };
        store.read(|_| ())?;
        Ok(store)
    }

    /// Path of the JSON document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_file(&self) -> Result<File, SchedulerError> {
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?)
    }

    fn load_from_disk(&self) -> Result<StoreState, SchedulerError> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(StoreState::default()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SchedulerError::Backend(format!("{}: corrupt store: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreState::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn rewrite_disk(&self, state: &StoreState) -> Result<(), SchedulerError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| SchedulerError::Backend(e.to_string()))?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<T>(&self, op: impl FnOnce(&StoreState) -> T) -> Result<T, SchedulerError> {
        let lock = self.lock_file()?;
        lock.lock_shared()?;
        let state = self.load_from_disk()?;
        Ok(op(&state))
    }

    fn write<T>(
        &self,
        op: impl FnOnce(&mut StoreState) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let lock = self.lock_file()?;
        lock.lock()?;
        let mut state = self.load_from_disk()?;
        let before = state.clone();
        let out = op(&mut state)?;
        if state != before {
            self.rewrite_disk(&state)?;
            debug!(path = %self.path.display(), tasks = state.len(), "file store rewritten");
        }
        Ok(out)
    }
}

impl TaskStore for FileStore {
    fn insert(&self, task: NewTask, now: Timestamp) -> Result<TaskId, SchedulerError> {
        self.write(|s| s.insert(task, now))
    }

    fn insert_unique(&self, task: NewTask, now: Timestamp) -> Result<Option<TaskId>, SchedulerError> {
        self.write(|s| s.insert_unique(task, now))
    }

    fn claim_next(&self, worker_id: &str, now: Timestamp) -> Result<Option<Task>, SchedulerError> {
        self.write(|s| Ok(s.claim_next(worker_id, now)))
    }

    fn complete(
        &self,
        id: TaskId,
        worker_id: &str,
        charge: Option<&UsageCharge>,
        now: Timestamp,
    ) -> Result<Completion, SchedulerError> {
        self.write(|s| s.complete(id, worker_id, charge, now))
    }

    fn fail(
        &self,
        id: TaskId,
        worker_id: &str,
        failure: Failure,
        now: Timestamp,
    ) -> Result<Task, SchedulerError> {
        self.write(|s| s.fail(id, worker_id, failure, now))
    }

    fn cancel(&self, id: TaskId, now: Timestamp) -> Result<Task, SchedulerError> {
        self.write(|s| s.cancel(id, now))
    }

    fn reschedule(&self, id: TaskId, at: Timestamp) -> Result<Task, SchedulerError> {
        self.write(|s| s.reschedule(id, at))
    }

    fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        self.read(|s| s.get(id))?
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        self.read(|s| s.list(filter))
    }

    fn recover_stale(
        &self,
        started_before: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Task>, SchedulerError> {
        self.write(|s| Ok(s.recover_stale(started_before, now)))
    }
}

impl Ledger for FileStore {
    fn check_and_record(
        &self,
        user: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> Result<RateDecision, SchedulerError> {
        self.write(|s| Ok(s.check_and_record(user, action, limit, window, now)))
    }

    fn prune_rate_windows(&self, older_than: Timestamp) -> Result<usize, SchedulerError> {
        self.write(|s| Ok(s.prune_rate_windows(older_than)))
    }

    fn set_usage_limit(
        &self,
        user: &str,
        period: &str,
        posts_limit: u32,
    ) -> Result<UsageRecord, SchedulerError> {
        self.write(|s| Ok(s.set_usage_limit(user, period, posts_limit)))
    }

    fn check_and_consume_usage(&self, user: &str, period: &str) -> Result<UsageDecision, SchedulerError> {
        self.write(|s| Ok(s.consume_usage(user, period)))
    }

    fn usage(&self, user: &str, period: &str) -> Result<Option<UsageRecord>, SchedulerError> {
        self.read(|s| s.usage(user, period))
    }
}
