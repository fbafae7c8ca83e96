//! Durable SQLite backend.
//!
//! Any number of worker processes may open the same database file. Every
//! state transition runs inside a `BEGIN IMMEDIATE` transaction, so SQLite's
//! write lock serializes the read-check-write sequence across processes, and
//! the claim itself is a single `UPDATE ... RETURNING` guarded by
//! `status = 'pending'`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, warn};

use crate::core::audit::{AuditEvent, AuditSink};
use crate::core::ledger::{retry_after, Ledger, RateDecision, UsageCharge, UsageDecision, UsageRecord};
use crate::core::store::{
    require_dedupe_key, require_owner, Completion, Failure, TaskStore, DEFAULT_MAX_ATTEMPTS,
    QUOTA_EXCEEDED_ERROR, WORKER_LOST_ERROR,
};
use crate::core::task::{NewTask, Task, TaskFilter, TaskStatus};
use crate::core::SchedulerError;
use crate::infra::state::apply_failure;
use crate::util::clock::duration_ms;
use crate::util::serde::{TaskId, Timestamp};

const TASK_COLUMNS: &str = "id, task_type, payload, status, priority, scheduled_for, created_at, \
     started_at, completed_at, attempts, max_attempts, last_error, owner, dedupe_key, claimed_by";

/// Connection tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteOptions {
    /// How long a statement waits on another process's lock before failing
    /// with `StoreUnavailable`.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// SQLite-backed task store and ledger.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, options: SqliteOptions) -> Result<Self, SchedulerError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::from_connection(conn, options)
    }

    /// Private in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        Self::from_connection(Connection::open_in_memory()?, SqliteOptions::default())
    }

    fn from_connection(conn: Connection, options: SqliteOptions) -> Result<Self, SchedulerError> {
        conn.busy_timeout(options.busy_timeout)?;
        for statement in Self::migrations() {
            conn.execute_batch(statement)?;
        }
        debug!("sqlite schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Returns SQL migration statements for the scheduler schema.
    #[must_use]
    pub fn migrations() -> &'static [&'static str] {
        &[
            r"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    scheduled_for INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_error TEXT,
    owner TEXT,
    dedupe_key TEXT,
    claimed_by TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks (status, scheduled_for, priority);
CREATE INDEX IF NOT EXISTS idx_tasks_dedupe ON tasks (task_type, dedupe_key) WHERE dedupe_key IS NOT NULL;
",
            r"
CREATE TABLE IF NOT EXISTS usage_records (
    user_id TEXT NOT NULL,
    period TEXT NOT NULL,
    posts_used INTEGER NOT NULL DEFAULT 0,
    posts_limit INTEGER NOT NULL,
    PRIMARY KEY (user_id, period)
);
CREATE TABLE IF NOT EXISTS rate_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    action TEXT NOT NULL,
    occurred_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_rate_events_key ON rate_events (user_id, action, occurred_at);
",
            r"
CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    task_type TEXT NOT NULL,
    action TEXT NOT NULL,
    worker_id TEXT,
    detail TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_events_task ON audit_events (task_id);
",
        ]
    }

    /// Audit sink writing into this database's `audit_events` table.
    #[must_use]
    pub fn audit_sink(&self) -> SqliteAuditSink {
        SqliteAuditSink {
            conn: Arc::clone(&self.conn),
        }
    }

    fn transact<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = op(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let payload: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Task {
        id: row.get(0)?,
        task_type: row.get(1)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| conversion_error(2, format!("payload: {e}")))?,
        status: status.parse().map_err(|e| conversion_error(3, e))?,
        priority: row.get(4)?,
        scheduled_for: row.get(5)?,
        created_at: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        attempts: row.get(9)?,
        max_attempts: row.get(10)?,
        last_error: row.get(11)?,
        owner: row.get(12)?,
        dedupe_key: row.get(13)?,
        claimed_by: row.get(14)?,
    })
}

fn load_task(tx: &Transaction<'_>, id: TaskId) -> Result<Task, SchedulerError> {
    tx.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        params![id],
        task_from_row,
    )
    .optional()?
    .ok_or(SchedulerError::NotFound(id))
}

fn store_task(tx: &Transaction<'_>, task: &Task) -> Result<(), SchedulerError> {
    tx.execute(
        "UPDATE tasks SET status = ?2, scheduled_for = ?3, started_at = ?4, completed_at = ?5,
             attempts = ?6, last_error = ?7, claimed_by = ?8
         WHERE id = ?1",
        params![
            task.id,
            task.status.as_str(),
            task.scheduled_for,
            task.started_at,
            task.completed_at,
            task.attempts,
            task.last_error,
            task.claimed_by,
        ],
    )?;
    Ok(())
}

fn insert_row(tx: &Transaction<'_>, task: NewTask, now: Timestamp) -> Result<TaskId, SchedulerError> {
    task.validate().map_err(SchedulerError::Validation)?;
    let row = task.into_task(0, now, DEFAULT_MAX_ATTEMPTS);
    let payload = serde_json::to_string(&row.payload)
        .map_err(|e| SchedulerError::Validation(format!("payload: {e}")))?;
    tx.execute(
        "INSERT INTO tasks (task_type, payload, status, priority, scheduled_for, created_at,
             attempts, max_attempts, owner, dedupe_key)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9)",
        params![
            row.task_type,
            payload,
            TaskStatus::Pending.as_str(),
            row.priority,
            row.scheduled_for,
            row.created_at,
            row.max_attempts,
            row.owner,
            row.dedupe_key,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn consume_usage(tx: &Transaction<'_>, user: &str, period: &str) -> Result<UsageDecision, SchedulerError> {
    let consumed = tx.execute(
        "UPDATE usage_records SET posts_used = posts_used + 1
         WHERE user_id = ?1 AND period = ?2 AND posts_used < posts_limit",
        params![user, period],
    )?;
    let Some(record) = usage_row(tx, user, period)? else {
        return Ok(UsageDecision::NoPlan);
    };
    Ok(if consumed == 1 {
        UsageDecision::Allowed(record)
    } else {
        UsageDecision::Denied(record)
    })
}

fn usage_row(conn: &Connection, user: &str, period: &str) -> Result<Option<UsageRecord>, SchedulerError> {
    Ok(conn
        .query_row(
            "SELECT user_id, period, posts_used, posts_limit FROM usage_records
             WHERE user_id = ?1 AND period = ?2",
            params![user, period],
            |row| {
                Ok(UsageRecord {
                    user: row.get(0)?,
                    period: row.get(1)?,
                    posts_used: row.get(2)?,
                    posts_limit: row.get(3)?,
                })
            },
        )
        .optional()?)
}

impl TaskStore for SqliteStore {
    fn insert(&self, task: NewTask, now: Timestamp) -> Result<TaskId, SchedulerError> {
        self.transact(|tx| insert_row(tx, task, now))
    }

    fn insert_unique(&self, task: NewTask, now: Timestamp) -> Result<Option<TaskId>, SchedulerError> {
        require_dedupe_key(&task)?;
        self.transact(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM tasks
                     WHERE task_type = ?1 AND dedupe_key = ?2 AND status IN ('pending', 'running'))",
                params![task.task_type, task.dedupe_key],
                |row| row.get(0),
            )?;
            if exists {
                return Ok(None);
            }
            insert_row(tx, task, now).map(Some)
        })
    }

    fn claim_next(&self, worker_id: &str, now: Timestamp) -> Result<Option<Task>, SchedulerError> {
        self.transact(|tx| {
            Ok(tx
                .query_row(
                    &format!(
                        "UPDATE tasks SET status = 'running', started_at = ?1, claimed_by = ?2
                         WHERE id = (
                             SELECT id FROM tasks
                             WHERE status = 'pending' AND scheduled_for <= ?1 AND attempts < max_attempts
                             ORDER BY priority DESC, scheduled_for ASC, id ASC
                             LIMIT 1
                         ) AND status = 'pending'
                         RETURNING {TASK_COLUMNS}"
                    ),
                    params![now, worker_id],
                    task_from_row,
                )
                .optional()?)
        })
    }

    fn complete(
        &self,
        id: TaskId,
        worker_id: &str,
        charge: Option<&UsageCharge>,
        now: Timestamp,
    ) -> Result<Completion, SchedulerError> {
        self.transact(|tx| {
            let mut task = load_task(tx, id)?;
            match task.status {
                TaskStatus::Running => require_owner(&task, worker_id)?,
                TaskStatus::Completed => return Ok(Completion::AlreadyCompleted(task)),
                TaskStatus::Pending => return Err(SchedulerError::NotRunning(id)),
                status @ (TaskStatus::Failed | TaskStatus::Cancelled) => {
                    return Err(SchedulerError::AlreadyTerminal { id, status })
                }
            }
            let allowed = match charge {
                Some(c) => consume_usage(tx, &c.user, &c.period)?.is_allowed(),
                None => true,
            };
            task.completed_at = Some(now);
            task.claimed_by = None;
            let completion = if allowed {
                task.status = TaskStatus::Completed;
                store_task(tx, &task)?;
                Completion::Completed(task)
            } else {
                task.status = TaskStatus::Failed;
                task.last_error = Some(QUOTA_EXCEEDED_ERROR.to_string());
                store_task(tx, &task)?;
                Completion::QuotaDenied(task)
            };
            Ok(completion)
        })
    }

    fn fail(
        &self,
        id: TaskId,
        worker_id: &str,
        failure: Failure,
        now: Timestamp,
    ) -> Result<Task, SchedulerError> {
        self.transact(|tx| {
            let mut task = load_task(tx, id)?;
            if task.status != TaskStatus::Running {
                return Err(SchedulerError::NotRunning(id));
            }
            require_owner(&task, worker_id)?;
            apply_failure(&mut task, failure, now);
            store_task(tx, &task)?;
            Ok(task)
        })
    }

    fn cancel(&self, id: TaskId, now: Timestamp) -> Result<Task, SchedulerError> {
        self.transact(|tx| {
            let mut task = load_pending(tx, id)?;
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now);
            store_task(tx, &task)?;
            Ok(task)
        })
    }

    fn reschedule(&self, id: TaskId, at: Timestamp) -> Result<Task, SchedulerError> {
        self.transact(|tx| {
            let mut task = load_pending(tx, id)?;
            task.scheduled_for = at;
            store_task(tx, &task)?;
            Ok(task)
        })
    }

    fn get(&self, id: TaskId) -> Result<Task, SchedulerError> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()?
        .ok_or(SchedulerError::NotFound(id))
    }

    fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            args.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(task_type) = &filter.task_type {
            args.push(Value::Text(task_type.clone()));
            sql.push_str(&format!(" AND task_type = ?{}", args.len()));
        }
        if let Some(owner) = &filter.owner {
            args.push(Value::Text(owner.clone()));
            sql.push_str(&format!(" AND owner = ?{}", args.len()));
        }
        if let Some(due_before) = filter.due_before {
            args.push(Value::Integer(due_before));
            sql.push_str(&format!(" AND scheduled_for <= ?{}", args.len()));
        }
        if filter.status == Some(TaskStatus::Pending) {
            sql.push_str(" ORDER BY priority DESC, scheduled_for ASC, id ASC");
        } else {
            sql.push_str(" ORDER BY id ASC");
        }
        if let Some(limit) = filter.limit {
            args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), task_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn recover_stale(
        &self,
        started_before: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<Task>, SchedulerError> {
        self.transact(|tx| {
            let stale = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'running' AND started_at < ?1 ORDER BY id"
                ))?;
                let rows = stmt.query_map(params![started_before], task_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let mut recovered = Vec::with_capacity(stale.len());
            for mut task in stale {
                let failure = Failure::Transient {
                    error: WORKER_LOST_ERROR.to_string(),
                    retry_at: now,
                };
                apply_failure(&mut task, failure, now);
                store_task(tx, &task)?;
                recovered.push(task);
            }
            Ok(recovered)
        })
    }
}

fn load_pending(tx: &Transaction<'_>, id: TaskId) -> Result<Task, SchedulerError> {
    let task = load_task(tx, id)?;
    match task.status {
        TaskStatus::Pending => Ok(task),
        TaskStatus::Running => Err(SchedulerError::AlreadyRunning(id)),
        status => Err(SchedulerError::AlreadyTerminal { id, status }),
    }
}

impl Ledger for SqliteStore {
    fn check_and_record(
        &self,
        user: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> Result<RateDecision, SchedulerError> {
        let window_ms = duration_ms(window);
        self.transact(|tx| {
            tx.execute(
                "DELETE FROM rate_events WHERE user_id = ?1 AND action = ?2 AND occurred_at <= ?3",
                params![user, action, now.saturating_sub(window_ms)],
            )?;
            let (count, oldest): (u32, Option<Timestamp>) = tx.query_row(
                "SELECT COUNT(*), MIN(occurred_at) FROM rate_events WHERE user_id = ?1 AND action = ?2",
                params![user, action],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if count < limit {
                tx.execute(
                    "INSERT INTO rate_events (user_id, action, occurred_at) VALUES (?1, ?2, ?3)",
                    params![user, action, now],
                )?;
                Ok(RateDecision::Allowed {
                    remaining: limit - count - 1,
                })
            } else {
                Ok(RateDecision::Denied {
                    retry_after_ms: retry_after(oldest.unwrap_or(now), window_ms, now),
                })
            }
        })
    }

    fn prune_rate_windows(&self, older_than: Timestamp) -> Result<usize, SchedulerError> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM rate_events WHERE occurred_at < ?1",
            params![older_than],
        )?)
    }

    fn set_usage_limit(
        &self,
        user: &str,
        period: &str,
        posts_limit: u32,
    ) -> Result<UsageRecord, SchedulerError> {
        self.transact(|tx| {
            tx.execute(
                "INSERT INTO usage_records (user_id, period, posts_used, posts_limit)
                 VALUES (?1, ?2, 0, ?3)
                 ON CONFLICT (user_id, period) DO UPDATE SET posts_limit = excluded.posts_limit",
                params![user, period, posts_limit],
            )?;
            usage_row(tx, user, period)?.ok_or_else(|| {
                SchedulerError::Backend(format!("usage record for {user}/{period} vanished"))
            })
        })
    }

    fn check_and_consume_usage(&self, user: &str, period: &str) -> Result<UsageDecision, SchedulerError> {
        self.transact(|tx| consume_usage(tx, user, period))
    }

    fn usage(&self, user: &str, period: &str) -> Result<Option<UsageRecord>, SchedulerError> {
        let conn = self.conn.lock();
        usage_row(&conn, user, period)
    }
}

/// Audit sink persisting events next to the task rows.
pub struct SqliteAuditSink {
    conn: Arc<Mutex<Connection>>,
}

impl AuditSink for SqliteAuditSink {
    fn record(&mut self, event: AuditEvent) {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO audit_events (task_id, task_type, action, worker_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.task_id,
                event.task_type,
                event.action.as_str(),
                event.worker_id,
                event.detail,
                event.created_at_ms,
            ],
        );
        if let Err(e) = result {
            warn!(task_id = event.task_id, "failed to persist audit event: {e}");
        }
    }
}
