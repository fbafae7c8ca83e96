//! Tests for builders

use std::sync::Arc;

use async_trait::async_trait;
use prometheus_work_queue::builders::{
    build_backend, build_engine, build_housekeeper, build_producer, build_retry_policies,
    build_trigger, build_worker_group,
};
use prometheus_work_queue::config::{RetryPolicyConfig, SchedulerConfig, StoreBackendConfig};
use prometheus_work_queue::core::{
    AppResult, DueItem, HandlerRegistry, NewTask, NotifyWake, PeriodicJob, SchedulerError,
    TaskFilter, TaskStatus, TaskStore, WakeChannel,
};
use prometheus_work_queue::runtime::EnqueueOptions;
use prometheus_work_queue::util::clock::SystemClock;

#[test]
fn test_build_each_backend() {
    let dir = tempfile::tempdir().unwrap();
    let stores = [
        StoreBackendConfig::Memory,
        StoreBackendConfig::File {
            path: dir.path().join("nested/queue.json"),
        },
        StoreBackendConfig::Sqlite {
            path: dir.path().join("queue.db"),
            busy_timeout_ms: 1_000,
        },
    ];
    for cfg in &stores {
        let backend = build_backend(cfg).unwrap();
        let id = backend
            .insert(NewTask::new("publish", serde_json::json!({})), 0)
            .unwrap();
        assert_eq!(backend.get(id).unwrap().status, TaskStatus::Pending, "{cfg}");
    }
}

#[test]
fn test_build_retry_policies_rejects_invalid_config() {
    let mut cfg = SchedulerConfig::default();
    cfg.retry.default.max_attempts = 0;
    assert!(matches!(
        build_retry_policies(&cfg),
        Err(SchedulerError::Configuration(_))
    ));
}

#[test]
fn test_build_full_pipeline() {
    let mut cfg = SchedulerConfig::default();
    cfg.worker.concurrency = 2;
    cfg.retry.default.max_attempts = 7;

    let backend = build_backend(&cfg.store).unwrap();
    let wake: Arc<dyn WakeChannel> = Arc::new(NotifyWake::new());
    let clock = Arc::new(SystemClock);

    let producer = build_producer(&cfg, backend.clone(), wake.clone(), clock.clone()).unwrap();
    let id = producer
        .enqueue("publish", &serde_json::json!({"image": 1}), EnqueueOptions::default())
        .unwrap();
    assert_eq!(producer.get_status(id).unwrap().max_attempts, 7);

    let engine = build_engine(
        &cfg,
        backend.clone(),
        HandlerRegistry::new(),
        wake.clone(),
        clock.clone(),
    )
    .unwrap();
    let group = build_worker_group(&cfg, Arc::new(engine), wake);
    assert_eq!(group.concurrency(), 2);

    let report = build_housekeeper(&cfg, backend, clock).run_once().unwrap();
    assert_eq!(report.recovered, 0);
}

struct OneUpload;

#[async_trait]
impl PeriodicJob for OneUpload {
    async fn scan(&self, now: i64) -> AppResult<Vec<DueItem>> {
        Ok(vec![DueItem::new("upload", "file-1", serde_json::json!({})).scheduled_for(now)])
    }
}

#[tokio::test]
async fn test_build_trigger_uses_per_type_ceiling() {
    let mut cfg = SchedulerConfig::default();
    cfg.retry.per_type.insert(
        "upload".into(),
        RetryPolicyConfig {
            max_attempts: 5,
            ..RetryPolicyConfig::default()
        },
    );
    let backend = build_backend(&cfg.store).unwrap();
    let trigger = build_trigger(
        &cfg,
        backend.clone(),
        Arc::new(NotifyWake::new()),
        Arc::new(SystemClock),
    )
    .unwrap();

    let report = trigger.run_job_once(&OneUpload).await.unwrap();
    assert_eq!(report.enqueued, 1);
    let pending = backend.list(&TaskFilter::pending()).unwrap();
    assert_eq!(pending[0].max_attempts, 5);

    cfg.retry.default.max_attempts = 0;
    assert!(matches!(
        build_trigger(&cfg, backend, Arc::new(NotifyWake::new()), Arc::new(SystemClock)),
        Err(SchedulerError::Configuration(_))
    ));
}
