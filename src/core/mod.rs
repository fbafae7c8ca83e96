//! Core scheduling abstractions: task model, store contract, engine, workers.

pub mod audit;
pub mod engine;
pub mod error;
pub mod handler;
pub mod housekeeping;
pub mod ledger;
pub mod retry;
pub mod slots;
pub mod store;
pub mod task;
pub mod trigger;
pub mod wake;
pub mod worker;

pub use audit::{AuditAction, AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use engine::{Disposition, ExecutionEngine, RunReport, StoreRetry, UserNotification, NOTIFY_USER_TASK};
pub use error::{AppResult, SchedulerError};
pub use handler::{
    handler_fn, FailureCategory, FnHandler, HandlerContext, HandlerError, HandlerOutcome,
    HandlerRegistry, TaskHandler,
};
pub use housekeeping::{Housekeeper, HousekeepingReport, HousekeepingSettings};
pub use ledger::{monthly_period, Ledger, RateDecision, UsageCharge, UsageDecision, UsageRecord};
pub use retry::{Backoff, RetryPolicies, RetryPolicy};
pub use slots::{conflicts, WeeklySchedule, WeeklySlot};
pub use store::{Backend, Completion, Failure, TaskStore};
pub use task::{ClaimKey, NewTask, Task, TaskFilter, TaskStatus};
pub use trigger::{DueItem, PeriodicJob, PeriodicTrigger, ScheduleDefinition, TriggerReport};
pub use wake::{NotifyWake, PollOnlyWake, WakeChannel, WakeReason};
pub use worker::{ShutdownHandle, Spawn, Worker, WorkerGroup, WorkerSettings, WorkerStats};
