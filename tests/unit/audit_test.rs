//! Tests for audit sinks

use prometheus_work_queue::core::{
    AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, NewTask, TracingAuditSink,
};
use prometheus_work_queue::infra::SqliteStore;
use serde_json::json;

#[test]
fn test_in_memory_audit_sink() {
    let task = NewTask::new("publish", json!({})).into_task(7, 100, 3);
    let mut sink = InMemoryAuditSink::new(10);

    sink.record(AuditEvent::new(&task, AuditAction::Claimed, 101).worker("w1"));
    sink.record(AuditEvent::new(&task, AuditAction::Retried, 102).detail("timeout"));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].task_id, 7);
    assert_eq!(events[0].worker_id.as_deref(), Some("w1"));
    assert_eq!(events[1].detail.as_deref(), Some("timeout"));
}

#[test]
fn test_audit_action_labels() {
    assert_eq!(AuditAction::QuotaDenied.to_string(), "quota_denied");
    assert_eq!(
        serde_json::to_value(AuditAction::Alert).unwrap(),
        json!("alert")
    );
}

#[test]
fn test_tracing_and_sqlite_sinks_accept_events() {
    let task = NewTask::new("publish", json!({})).into_task(1, 0, 3);
    let mut tracing_sink = TracingAuditSink;
    tracing_sink.record(AuditEvent::new(&task, AuditAction::Alert, 1).detail("no handler"));

    let store = SqliteStore::open_in_memory().unwrap();
    let mut sqlite_sink = store.audit_sink();
    sqlite_sink.record(AuditEvent::new(&task, AuditAction::Enqueued, 1));
}
