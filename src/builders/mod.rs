//! Builders to construct scheduler components from configuration.

pub mod scheduler_builder;

pub use scheduler_builder::{
    build_backend, build_engine, build_housekeeper, build_producer, build_retry_policies,
    build_trigger, build_worker_group,
};
