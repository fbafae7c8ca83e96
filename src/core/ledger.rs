//! Rate and quota ledger.
//!
//! Two kinds of usage state live next to the task rows:
//!
//! - **Rate windows**: timestamped events per `(user, action)` within a
//!   trailing interval, used to reject bursts.
//! - **Usage records**: per-user, per-period counters bounding how many
//!   side-effecting completions a user may trigger in a billing period.
//!
//! Every check-and-increment is a single atomic operation in the backend, so
//! concurrent callers for the same key never both observe "room available".

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;
use crate::util::serde::{Timestamp, UserId};

/// Per-user, per-period usage counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Owning user.
    pub user: UserId,
    /// Period label, e.g. `2026-10`.
    pub period: String,
    /// Completions consumed in the period.
    pub posts_used: u32,
    /// Completions allowed in the period.
    pub posts_limit: u32,
}

impl UsageRecord {
    /// Units left in the period.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.posts_limit.saturating_sub(self.posts_used)
    }
}

/// Quota unit a handler asks to consume atomically with task completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCharge {
    /// User charged.
    pub user: UserId,
    /// Period charged.
    pub period: String,
}

impl UsageCharge {
    /// Charge one unit to `user` in `period`.
    pub fn new(user: impl Into<UserId>, period: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            period: period.into(),
        }
    }
}

/// Result of a sliding-window rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The event was recorded.
    Allowed {
        /// Events still allowed in the current window.
        remaining: u32,
    },
    /// The window is full; nothing was recorded.
    Denied {
        /// Milliseconds until the oldest event leaves the window.
        retry_after_ms: i64,
    },
}

impl RateDecision {
    /// Whether the event was admitted.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Result of a usage check-and-consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageDecision {
    /// One unit was consumed; the record reflects the new count.
    Allowed(UsageRecord),
    /// The period is exhausted; nothing was consumed.
    Denied(UsageRecord),
    /// No plan is configured for the user in that period.
    NoPlan,
}

impl UsageDecision {
    /// Whether a unit was consumed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// Atomic rate-limit and quota operations.
pub trait Ledger: Send + Sync {
    /// Count `(user, action)` events inside the trailing `window` ending at
    /// `now`; record a new one and allow if fewer than `limit`, deny otherwise.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backend cannot be reached.
    fn check_and_record(
        &self,
        user: &str,
        action: &str,
        limit: u32,
        window: Duration,
        now: Timestamp,
    ) -> Result<RateDecision, SchedulerError>;

    /// Drop rate events recorded before `older_than`; returns how many.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backend cannot be reached.
    fn prune_rate_windows(&self, older_than: Timestamp) -> Result<usize, SchedulerError>;

    /// Create or update the limit for a period, keeping its usage count.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backend cannot be reached.
    fn set_usage_limit(
        &self,
        user: &str,
        period: &str,
        posts_limit: u32,
    ) -> Result<UsageRecord, SchedulerError>;

    /// Consume one unit of the period's quota if any is left.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backend cannot be reached.
    fn check_and_consume_usage(
        &self,
        user: &str,
        period: &str,
    ) -> Result<UsageDecision, SchedulerError>;

    /// Current usage record, if any.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the backend cannot be reached.
    fn usage(&self, user: &str, period: &str) -> Result<Option<UsageRecord>, SchedulerError>;
}

/// Monthly period label (`YYYY-MM`, UTC) containing `ts`.
#[must_use]
pub fn monthly_period(ts: Timestamp) -> String {
    let at = DateTime::<Utc>::from_timestamp_millis(ts).unwrap_or_default();
    format!("{:04}-{:02}", at.year(), at.month())
}

/// Milliseconds until the oldest in-window event expires.
pub(crate) fn retry_after(oldest: Timestamp, window_ms: i64, now: Timestamp) -> i64 {
    (oldest + window_ms - now).max(0)
}
