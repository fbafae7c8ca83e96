//! Tests for error classification

use prometheus_work_queue::core::{FailureCategory, HandlerError, SchedulerError, TaskStatus};

#[test]
fn test_only_store_unavailable_is_retryable() {
    assert!(SchedulerError::StoreUnavailable("locked".into()).is_retryable());
    assert!(!SchedulerError::NotFound(1).is_retryable());
    assert!(!SchedulerError::AlreadyRunning(1).is_retryable());
    assert!(!SchedulerError::Configuration("dup".into()).is_retryable());
}

#[test]
fn test_error_messages_name_the_task() {
    let err = SchedulerError::AlreadyTerminal {
        id: 9,
        status: TaskStatus::Cancelled,
    };
    assert_eq!(err.to_string(), "task 9 is already cancelled");
    assert_eq!(SchedulerError::NotFound(3).to_string(), "task 3 not found");
}

#[test]
fn test_unclassified_handler_errors_are_transient() {
    let err: HandlerError = anyhow::anyhow!("connection reset").into();
    assert!(err.is_transient());

    let err: HandlerError = SchedulerError::StoreUnavailable("busy".into()).into();
    assert!(err.is_transient());

    let err = HandlerError::permanent(FailureCategory::AuthorizationExpired, "token revoked");
    assert!(!err.is_transient());
}
