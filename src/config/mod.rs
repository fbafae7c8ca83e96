//! Configuration models for the store, workers, retries, and slots.

pub mod scheduler;

pub use scheduler::{
    BackoffConfig, HousekeepingConfig, RetryConfig, RetryPolicyConfig, ScheduleConfig,
    SchedulerConfig, StoreBackendConfig, WorkerConfig,
};
