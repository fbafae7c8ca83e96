//! Tests for the producer API and tokio spawner

use std::sync::Arc;

use prometheus_work_queue::core::{
    NewTask, NotifyWake, RetryPolicies, SchedulerError, Spawn, TaskFilter, TaskStatus,
    TaskStore, WeeklySchedule,
};
use prometheus_work_queue::infra::MemoryStore;
use prometheus_work_queue::runtime::tokio_spawner::TokioSpawner;
use prometheus_work_queue::runtime::{EnqueueOptions, Producer, TaskStatusResponse};
use prometheus_work_queue::util::clock::ManualClock;

// Monday 2026-10-19T00:00:00Z
const MONDAY: i64 = 1_792_368_000_000;
const HOUR: i64 = 3_600_000;

fn producer_at(now: i64) -> (Arc<MemoryStore>, Producer) {
    let store = Arc::new(MemoryStore::new());
    let producer = Producer::new(
        store.clone(),
        Arc::new(NotifyWake::new()),
        RetryPolicies::default(),
        Arc::new(ManualClock::new(now)),
    );
    (store, producer)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[test]
fn test_next_publish_slot_skips_taken_slots() {
    let (_, producer) = producer_at(MONDAY);
    assert_eq!(producer.next_publish_slot("publish").unwrap(), MONDAY + 7 * HOUR);

    producer
        .enqueue(
            "publish",
            &serde_json::json!({"image": 1}),
            EnqueueOptions {
                scheduled_for: Some(MONDAY + 7 * HOUR),
                ..EnqueueOptions::default()
            },
        )
        .unwrap();
    // Wednesday 11:00
    assert_eq!(
        producer.next_publish_slot("publish").unwrap(),
        MONDAY + 2 * 24 * HOUR + 11 * HOUR
    );
    // Other task types do not occupy publishing slots.
    assert_eq!(producer.next_publish_slot("report").unwrap(), MONDAY + 7 * HOUR);
}

#[test]
fn test_custom_schedule() {
    let (_, producer) = producer_at(MONDAY);
    let producer = producer.with_schedule(WeeklySchedule::parse("1:12:00").unwrap());
    assert_eq!(
        producer.next_publish_slot("publish").unwrap(),
        MONDAY + 24 * HOUR + 12 * HOUR
    );
}

#[test]
fn test_cancel_and_status() {
    let (store, producer) = producer_at(MONDAY);
    let id = producer
        .enqueue_task(NewTask::new("publish", serde_json::json!({})).owner("hana"))
        .unwrap();

    let status = TaskStatusResponse::from(&producer.get_status(id).unwrap());
    assert_eq!(status.status, TaskStatus::Pending);
    assert_eq!(status.max_attempts, 3);

    producer.cancel(id).unwrap();
    assert_eq!(producer.get_status(id).unwrap().status, TaskStatus::Cancelled);
    assert!(producer
        .list_pending(TaskFilter::default().with_owner("hana"))
        .unwrap()
        .is_empty());
    assert!(matches!(
        producer.cancel(id),
        Err(SchedulerError::AlreadyTerminal { .. })
    ));
    assert!(store.claim_next("w", MONDAY).unwrap().is_none());
}

#[test]
fn test_enqueue_unique_requires_key() {
    let (_, producer) = producer_at(MONDAY);
    assert!(matches!(
        producer.enqueue_unique(NewTask::new("publish", serde_json::json!({}))),
        Err(SchedulerError::Validation(_))
    ));
}

#[test]
fn test_get_status_of_unknown_task() {
    let (_, producer) = producer_at(MONDAY);
    assert!(matches!(
        producer.get_status(404),
        Err(SchedulerError::NotFound(404))
    ));
}
