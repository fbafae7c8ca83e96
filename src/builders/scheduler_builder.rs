//! Wire configuration into backends, producers, engines and worker groups.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{SchedulerConfig, StoreBackendConfig};
use crate::core::{
    Backend, ExecutionEngine, HandlerRegistry, Housekeeper, PeriodicTrigger, RetryPolicies,
    SchedulerError, WakeChannel, WorkerGroup,
};
use crate::infra::{FileStore, MemoryStore, SqliteOptions, SqliteStore};
use crate::runtime::Producer;
use crate::util::clock::Clock;

fn config_error(e: String) -> SchedulerError {
    SchedulerError::Configuration(format!("config invalid: {e}"))
}

/// Open the configured storage backend.
///
/// # Errors
///
/// `StoreUnavailable` or `Backend` if the store cannot be opened.
pub fn build_backend(cfg: &StoreBackendConfig) -> Result<Arc<dyn Backend>, SchedulerError> {
    let backend: Arc<dyn Backend> = match cfg {
        StoreBackendConfig::Memory => Arc::new(MemoryStore::new()),
        StoreBackendConfig::File { path } => Arc::new(FileStore::open(path)?),
        StoreBackendConfig::Sqlite {
            path,
            busy_timeout_ms,
        } => Arc::new(SqliteStore::open(
            path,
            SqliteOptions {
                busy_timeout: Duration::from_millis(*busy_timeout_ms),
            },
        )?),
    };
    info!(store = %cfg, "task store opened");
    Ok(backend)
}

/// Retry policies from the retry section.
///
/// # Errors
///
/// `Configuration` if any policy is invalid.
pub fn build_retry_policies(cfg: &SchedulerConfig) -> Result<RetryPolicies, SchedulerError> {
    cfg.retry.validate().map_err(config_error)?;
    Ok(cfg.retry.to_policies())
}

/// Producer using the configured retry policies and weekly schedule.
///
/// # Errors
///
/// `Configuration` if the configuration does not validate.
pub fn build_producer(
    cfg: &SchedulerConfig,
    backend: Arc<dyn Backend>,
    wake: Arc<dyn WakeChannel>,
    clock: Arc<dyn Clock>,
) -> Result<Producer, SchedulerError> {
    cfg.validate().map_err(config_error)?;
    let schedule = cfg.schedule.to_schedule().map_err(config_error)?;
    Ok(Producer::new(backend, wake, cfg.retry.to_policies(), clock).with_schedule(schedule))
}

/// Execution engine for `registry`.
///
/// # Errors
///
/// `Configuration` if the configuration does not validate.
pub fn build_engine(
    cfg: &SchedulerConfig,
    backend: Arc<dyn Backend>,
    registry: HandlerRegistry,
    wake: Arc<dyn WakeChannel>,
    clock: Arc<dyn Clock>,
) -> Result<ExecutionEngine, SchedulerError> {
    cfg.validate().map_err(config_error)?;
    Ok(
        ExecutionEngine::new(backend, registry, cfg.retry.to_policies(), clock)
            .with_store_retry(cfg.worker.store_retry())
            .with_wake(wake),
    )
}

/// Worker group sized by `worker.concurrency`.
pub fn build_worker_group(
    cfg: &SchedulerConfig,
    engine: Arc<ExecutionEngine>,
    wake: Arc<dyn WakeChannel>,
) -> WorkerGroup {
    WorkerGroup::new(engine, wake, cfg.worker.settings(), cfg.worker.concurrency)
}

/// Periodic trigger stamping items with their type's attempt ceiling.
///
/// # Errors
///
/// `Configuration` if the retry section is invalid.
pub fn build_trigger(
    cfg: &SchedulerConfig,
    backend: Arc<dyn Backend>,
    wake: Arc<dyn WakeChannel>,
    clock: Arc<dyn Clock>,
) -> Result<PeriodicTrigger, SchedulerError> {
    let policies = build_retry_policies(cfg)?;
    Ok(PeriodicTrigger::new(backend, wake, clock).with_policies(policies))
}

/// Housekeeper with the configured cadence.
pub fn build_housekeeper(
    cfg: &SchedulerConfig,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
) -> Housekeeper {
    Housekeeper::new(backend, clock, cfg.housekeeping.settings())
        .with_policies(cfg.retry.to_policies())
}
