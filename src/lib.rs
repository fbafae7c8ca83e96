//! # Prometheus Work Queue
//!
//! A durable, concurrency-safe background task scheduler.
//!
//! Producers enqueue typed tasks with an opaque JSON payload into a shared
//! [`TaskStore`](core::TaskStore). Worker loops in one or more processes claim
//! due tasks atomically, dispatch them to the handler registered for their
//! type, and record the outcome. Failures are classified: transient failures
//! are retried with bounded backoff, permanent ones fail immediately and
//! notify the owning user.
//!
//! ## Guarantees
//!
//! - **Exclusive claim**: a pending task is handed to at most one worker.
//! - **Idempotent completion**: completing an already-completed task is a no-op.
//! - **Quota-safe completion**: consuming a user's monthly quota and marking the
//!   task completed happen in one atomic store step.
//! - **Bounded retry**: a task is tried at most `max_attempts` times.
//! - **Crash recovery**: tasks stuck in `running` past a threshold are
//!   released by the housekeeper.
//!
//! ## Backends
//!
//! - [`MemoryStore`](infra::MemoryStore) for tests and single-process use
//! - [`FileStore`](infra::FileStore), a single-writer JSON document
//! - [`SqliteStore`](infra::SqliteStore) for multi-process deployments
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_work_queue::builders::*;
//! use prometheus_work_queue::config::SchedulerConfig;
//! use prometheus_work_queue::core::*;
//! use prometheus_work_queue::runtime::{EnqueueOptions, TokioSpawner};
//! use prometheus_work_queue::util::clock::SystemClock;
//!
//! let cfg = SchedulerConfig::from_env()?;
//! let backend = build_backend(&cfg.store)?;
//! let wake: Arc<dyn WakeChannel> = Arc::new(NotifyWake::new());
//! let clock = Arc::new(SystemClock);
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("publish_post", handler_fn(|ctx: HandlerContext| async move {
//!     let post: serde_json::Value = ctx.payload()?;
//!     publish(post).await?;
//!     Ok(HandlerOutcome::Done)
//! }))?;
//!
//! let producer = build_producer(&cfg, backend.clone(), wake.clone(), clock.clone())?;
//! producer.enqueue("publish_post", &serde_json::json!({"image": 42}), EnqueueOptions::default())?;
//!
//! let engine = Arc::new(build_engine(&cfg, backend, registry, wake.clone(), clock)?);
//! let handle = build_worker_group(&cfg, engine, wake).start(&TokioSpawner::current());
//! // ...
//! let stats = handle.shutdown().await;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Configuration models for the store, workers, retries and slots.
pub mod config;
/// Task model, store contract, execution engine and worker loops.
pub mod core;
/// Storage backends.
pub mod infra;
/// Producer API and runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
