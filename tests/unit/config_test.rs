//! Tests for configuration validation and loading

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use prometheus_work_queue::config::{
    BackoffConfig, RetryPolicyConfig, SchedulerConfig, StoreBackendConfig, WorkerConfig,
};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_worker_config_validation() {
    let valid = WorkerConfig::default();
    assert!(valid.validate().is_ok());
    assert!(valid.concurrency >= 1);

    let invalid = WorkerConfig {
        concurrency: 0,
        ..WorkerConfig::default()
    };
    assert!(invalid.validate().is_err());

    let invalid = WorkerConfig {
        poll_interval_ms: 0,
        ..WorkerConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "store": { "kind": "sqlite", "path": "/tmp/queue.db" },
        "worker": { "concurrency": 4, "poll_interval_ms": 250 },
        "retry": {
            "default": {
                "max_attempts": 5,
                "backoff": { "kind": "linear", "base_ms": 1000, "max_ms": 10000 }
            },
            "per_type": {
                "notify_user": {
                    "max_attempts": 2,
                    "backoff": { "kind": "exponential", "base_ms": 500, "factor": 3.0, "max_ms": 60000 }
                }
            }
        },
        "schedule": { "weekly": "0:09:00,3:09:00", "utc_offset_minutes": -300 }
    }"#;

    let config = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(
        config.store,
        StoreBackendConfig::Sqlite {
            path: PathBuf::from("/tmp/queue.db"),
            busy_timeout_ms: 5_000,
        }
    );
    assert_eq!(config.worker.concurrency, 4);
    assert_eq!(config.worker.store_retry_attempts, 5);
    assert_eq!(config.schedule.weekly.slots().len(), 2);

    let policies = config.retry.to_policies();
    assert_eq!(policies.for_type("publish").max_attempts, 5);
    assert_eq!(policies.for_type("notify_user").max_attempts, 2);
}

#[test]
fn test_invalid_retry_policy_is_rejected() {
    let mut config = SchedulerConfig::default();
    config.retry.per_type.insert(
        "publish".into(),
        RetryPolicyConfig {
            max_attempts: 0,
            backoff: BackoffConfig::Linear {
                base_ms: 1,
                max_ms: 1,
            },
        },
    );
    let err = config.validate().unwrap_err();
    assert!(err.contains("publish"), "{err}");
}

#[test]
fn test_malformed_json_reports_parse_error() {
    let err = SchedulerConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_env_overrides() {
    let config = SchedulerConfig::from_lookup(lookup(&[
        ("SCHEDULER_STORE", "file:/var/lib/queue.json"),
        ("SCHEDULER_POLL_INTERVAL_MS", "200"),
        ("SCHEDULER_CONCURRENCY", "2"),
        ("WEEKLY_SCHEDULE", "1:08:30"),
        ("SCHEDULER_UTC_OFFSET_MINUTES", "60"),
    ]))
    .unwrap();

    assert_eq!(
        config.store,
        StoreBackendConfig::File {
            path: PathBuf::from("/var/lib/queue.json")
        }
    );
    assert_eq!(config.worker.poll_interval_ms, 200);
    assert_eq!(config.worker.concurrency, 2);
    assert_eq!(config.schedule.weekly.to_string(), "1:08:30");
    assert_eq!(config.schedule.utc_offset_minutes, 60);
}

#[test]
fn test_env_rejects_bad_values() {
    assert!(SchedulerConfig::from_lookup(lookup(&[("SCHEDULER_CONCURRENCY", "many")])).is_err());
    assert!(SchedulerConfig::from_lookup(lookup(&[("SCHEDULER_CONCURRENCY", "0")])).is_err());
    assert!(SchedulerConfig::from_lookup(lookup(&[("SCHEDULER_STORE", "redis://x")])).is_err());
    assert!(SchedulerConfig::from_lookup(lookup(&[("WEEKLY_SCHEDULE", "8:07:00")])).is_err());
    assert!(
        SchedulerConfig::from_lookup(lookup(&[("SCHEDULER_UTC_OFFSET_MINUTES", "100000")]))
            .is_err()
    );
}

#[test]
fn test_config_file_then_env() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "worker": {{ "concurrency": 3, "poll_interval_ms": 900 }} }}"#).unwrap();
    let path = file.path().to_string_lossy().into_owned();

    let config = SchedulerConfig::from_lookup(lookup(&[
        ("SCHEDULER_CONFIG", path.as_str()),
        ("SCHEDULER_POLL_INTERVAL_MS", "100"),
    ]))
    .unwrap();
    assert_eq!(config.worker.concurrency, 3);
    assert_eq!(config.worker.poll_interval_ms, 100);
    assert_eq!(config.store, StoreBackendConfig::Memory);
}
