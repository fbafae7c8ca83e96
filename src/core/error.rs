//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::task::TaskStatus;
use crate::util::serde::TaskId;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Caller supplied an invalid task, payload, or argument.
    #[error("validation error: {0}")]
    Validation(String),
    /// The backing store could not be reached; no task row was mutated.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// No task exists with the given identifier.
    #[error("task {0} not found")]
    NotFound(TaskId),
    /// The task is currently executing and cannot be changed.
    #[error("task {0} is already running")]
    AlreadyRunning(TaskId),
    /// The task reached a terminal state and never transitions again.
    #[error("task {id} is already {status}")]
    AlreadyTerminal {
        /// Task identifier.
        id: TaskId,
        /// Terminal status the task is in.
        status: TaskStatus,
    },
    /// The task is not owned by a worker, so it cannot be completed or failed.
    #[error("task {0} is not running")]
    NotRunning(TaskId),
    /// The task is running under another worker's claim.
    #[error("task {id} is not claimed by this worker")]
    NotOwner {
        /// Task identifier.
        id: TaskId,
        /// Worker currently holding the claim, if any.
        owner: Option<String>,
    },
    /// Startup-time wiring error (duplicate handler, invalid config).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Backend-specific failure with context.
    #[error("backend error: {0}")]
    Backend(String),
}

impl SchedulerError {
    /// Whether the caller should retry the operation after a backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull,
            ) => Self::StoreUnavailable(err.to_string()),
            _ => Self::Backend(err.to_string()),
        }
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_unavailable_is_retryable() {
        assert!(SchedulerError::StoreUnavailable("down".into()).is_retryable());
        assert!(!SchedulerError::NotFound(1).is_retryable());
        assert!(!SchedulerError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn io_errors_map_to_store_unavailable() {
        let err: SchedulerError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, SchedulerError::StoreUnavailable(_)));
    }
}
