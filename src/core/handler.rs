//! Handler registration and the classified error boundary.
//!
//! A handler either returns an outcome or a [`HandlerError`] that says whether
//! the failure is worth retrying. Anything unclassified (an `anyhow::Error`
//! bubbled up with `?`) is treated as transient.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::ledger::{Ledger, UsageCharge};
use crate::core::store::Backend;
use crate::core::task::Task;
use crate::core::SchedulerError;
use crate::util::clock::Clock;
use crate::util::serde::Timestamp;

/// Categorized reason for a permanent failure, safe to show to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The payload could not be decoded or is malformed.
    InvalidPayload,
    /// The remote platform refused the content.
    ContentRejected,
    /// The user's plan is exhausted for the period.
    QuotaExceeded,
    /// Too many actions in a short interval.
    RateLimited,
    /// Stored credentials no longer work.
    AuthorizationExpired,
    /// Referenced media is missing or unreadable.
    MediaUnavailable,
    /// Every retry failed.
    RetriesExhausted,
    /// No handler or configuration for this work.
    Misconfigured,
}

impl FailureCategory {
    /// Human-readable summary for user-facing notifications.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::InvalidPayload => "The request was incomplete or malformed and could not be processed.",
            Self::ContentRejected => "The platform rejected this content.",
            Self::QuotaExceeded => "You have reached your plan's limit for this period.",
            Self::RateLimited => "Too many requests in a short time. Please try again later.",
            Self::AuthorizationExpired => "Your account authorization has expired. Please reconnect your account.",
            Self::MediaUnavailable => "The media for this post could not be found or read.",
            Self::RetriesExhausted => "We could not complete this after several attempts.",
            Self::Misconfigured => "This kind of request is not supported right now.",
        }
    }

    /// Stable snake_case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::ContentRejected => "content_rejected",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimited => "rate_limited",
            Self::AuthorizationExpired => "authorization_expired",
            Self::MediaUnavailable => "media_unavailable",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Misconfigured => "misconfigured",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Network failure, throttling, 5xx: retry with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Malformed input or business rule violation: fail without retrying.
    #[error("permanent failure ({category}): {detail}")]
    Permanent {
        /// User-facing category.
        category: FailureCategory,
        /// Diagnostic detail, never shown to users.
        detail: String,
    },
}

impl HandlerError {
    /// Retryable failure.
    pub fn transient(detail: impl Into<String>) -> Self {
        Self::Transient(detail.into())
    }

    /// Non-retryable failure.
    pub fn permanent(category: FailureCategory, detail: impl Into<String>) -> Self {
        Self::Permanent {
            category,
            detail: detail.into(),
        }
    }

    /// Whether the failure should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Transient(format!("{err:#}"))
    }
}

impl From<SchedulerError> for HandlerError {
    fn from(err: SchedulerError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Successful handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Work done, nothing to charge.
    Done,
    /// Work done; consume one quota unit atomically with completion.
    DoneConsuming(UsageCharge),
}

/// Everything a handler may consult while running one task.
#[derive(Clone)]
pub struct HandlerContext {
    task: Task,
    worker_id: String,
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
}

impl HandlerContext {
    /// Build a context for `task` claimed by `worker_id`.
    pub fn new(
        task: Task,
        worker_id: impl Into<String>,
        backend: Arc<dyn Backend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task,
            worker_id: worker_id.into(),
            backend,
            clock,
        }
    }

    /// Snapshot of the claimed task.
    #[must_use]
    pub const fn task(&self) -> &Task {
        &self.task
    }

    /// Worker running the task.
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 1-based number of this try.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.task.attempts + 1
    }

    /// Decode the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns a permanent `InvalidPayload` failure if decoding fails.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.task.payload.clone()).map_err(|e| {
            HandlerError::permanent(
                FailureCategory::InvalidPayload,
                format!("payload for `{}`: {e}", self.task.task_type),
            )
        })
    }

    /// Rate and quota ledger.
    #[must_use]
    pub fn ledger(&self) -> &dyn Ledger {
        &*self.backend
    }

    /// Current time from the injected clock.
    #[must_use]
    pub fn now(&self) -> Timestamp {
        self.clock.now_ms()
    }
}

/// Processes tasks of one type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run the task to completion or a classified failure.
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, HandlerError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, HandlerError>> + Send,
{
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, HandlerError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutcome, HandlerError>> + Send,
{
    FnHandler(f)
}

/// Map from task type to its single handler, fixed at worker startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `task_type`.
    ///
    /// # Errors
    ///
    /// `Configuration` if the type is empty or already registered.
    pub fn register<H>(&mut self, task_type: impl Into<String>, handler: H) -> Result<(), SchedulerError>
    where
        H: TaskHandler + 'static,
    {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(SchedulerError::Configuration(
                "handler task type must not be empty".into(),
            ));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(SchedulerError::Configuration(format!(
                "handler for `{task_type}` already registered"
            )));
        }
        self.handlers.insert(task_type, Arc::new(handler));
        Ok(())
    }

    /// Handler for `task_type`, if registered.
    #[must_use]
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Whether a handler exists for `task_type`.
    #[must_use]
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
