//! Producer API surface and runtime adapters.

pub mod api;
pub mod tokio_spawner;

pub use api::{
    health, submit, EnqueueOptions, EnqueueRequest, Health, Producer, RebalanceReport,
    TaskStatusResponse,
};
pub use tokio_spawner::TokioSpawner;
