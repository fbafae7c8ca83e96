//! Retry and backoff policy.
//!
//! The delay before the next try is a pure function of how many tries have
//! failed so far. Both supported formulas are non-decreasing in `attempts`
//! and capped, so `scheduled_for` never moves backwards across retries.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `base * attempts`, capped at `max`.
    Linear {
        /// Delay unit.
        base: Duration,
        /// Upper bound.
        max: Duration,
    },
    /// `base * factor^(attempts - 1)`, capped at `max`.
    Exponential {
        /// Delay after the first failure.
        base: Duration,
        /// Growth factor, at least 1.0.
        factor: f64,
        /// Upper bound.
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait after `attempts` failed tries (`attempts >= 1`).
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        match *self {
            Self::Linear { base, max } => base.saturating_mul(attempts).min(max),
            Self::Exponential { base, factor, max } => {
                let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
                let scaled = base.as_secs_f64() * factor.powi(exponent);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match *self {
            Self::Linear { base, max } => {
                if base.is_zero() {
                    return Err("linear backoff base must be greater than 0".into());
                }
                if max < base {
                    return Err("backoff max must not be below base".into());
                }
            }
            Self::Exponential { base, factor, max } => {
                if base.is_zero() {
                    return Err("exponential backoff base must be greater than 0".into());
                }
                if !factor.is_finite() || factor < 1.0 {
                    return Err("exponential backoff factor must be >= 1.0".into());
                }
                if max < base {
                    return Err("backoff max must not be below base".into());
                }
            }
        }
        Ok(())
    }
}

/// Retry policy for one task type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Tries allowed before permanent failure.
    pub max_attempts: u32,
    /// Delay formula between tries.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(60),
                factor: 2.0,
                max: Duration::from_secs(3600),
            },
        }
    }
}

impl RetryPolicy {
    /// Delay before the next eligible try after `attempts` failures.
    #[must_use]
    pub fn next_schedule(&self, attempts: u32) -> Duration {
        self.backoff.delay(attempts)
    }

    /// Validate policy values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".into());
        }
        self.backoff.validate()
    }
}

/// Per-type retry policies with a fallback.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    per_type: HashMap<String, RetryPolicy>,
}

impl RetryPolicies {
    /// Create a set that applies `default` to every type.
    #[must_use]
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            per_type: HashMap::new(),
        }
    }

    /// Override the policy for one task type.
    #[must_use]
    pub fn with_type(mut self, task_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.per_type.insert(task_type.into(), policy);
        self
    }

    /// Policy governing `task_type`.
    #[must_use]
    pub fn for_type(&self, task_type: &str) -> &RetryPolicy {
        self.per_type.get(task_type).unwrap_or(&self.default)
    }
}
