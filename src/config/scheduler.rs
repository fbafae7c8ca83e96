//! Scheduler configuration structures.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::housekeeping::HousekeepingSettings;
use crate::core::retry::{Backoff, RetryPolicies, RetryPolicy};
use crate::core::slots::WeeklySchedule;
use crate::core::worker::WorkerSettings;
use crate::core::StoreRetry;

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// In-memory store for development/testing.
    Memory,
    /// Single-writer JSON document.
    File {
        /// Document path.
        path: PathBuf,
    },
    /// SQLite database shared by worker processes.
    Sqlite {
        /// Database path.
        path: PathBuf,
        /// Lock wait before reporting the store unavailable.
        #[serde(default = "default_busy_timeout_ms")]
        busy_timeout_ms: u64,
    },
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreBackendConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl FromStr for StoreBackendConfig {
    type Err = String;

    /// Parses `memory`, `file:<path>` or `sqlite:<path>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "memory" {
            return Ok(Self::Memory);
        }
        match s.split_once(':') {
            Some(("file", path)) if !path.is_empty() => Ok(Self::File { path: path.into() }),
            Some(("sqlite", path)) if !path.is_empty() => Ok(Self::Sqlite {
                path: path.into(),
                busy_timeout_ms: default_busy_timeout_ms(),
            }),
            _ => Err(format!(
                "unknown store `{s}`; expected memory, file:<path> or sqlite:<path>"
            )),
        }
    }
}

impl fmt::Display for StoreBackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::File { path } => write!(f, "file:{}", path.display()),
            Self::Sqlite { path, .. } => write!(f, "sqlite:{}", path.display()),
        }
    }
}

/// Worker loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Claim/execute loops per process.
    pub concurrency: usize,
    /// Longest idle wait before polling the store again.
    pub poll_interval_ms: u64,
    /// Tries for a store call made after a handler ran.
    pub store_retry_attempts: u32,
    /// Pause between store tries.
    pub store_retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            poll_interval_ms: 1_000,
            store_retry_attempts: 5,
            store_retry_delay_ms: 500,
        }
    }
}

impl WorkerConfig {
    /// Validate worker values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("concurrency must be greater than 0".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.store_retry_attempts == 0 {
            return Err("store_retry_attempts must be greater than 0".into());
        }
        Ok(())
    }

    /// Loop timing derived from this config.
    #[must_use]
    pub const fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            error_backoff: Duration::from_millis(self.store_retry_delay_ms),
        }
    }

    /// Store retry settings derived from this config.
    #[must_use]
    pub const fn store_retry(&self) -> StoreRetry {
        StoreRetry {
            attempts: self.store_retry_attempts,
            delay: Duration::from_millis(self.store_retry_delay_ms),
        }
    }
}

/// Backoff formula in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// `base_ms * attempts`, capped.
    Linear {
        /// Delay unit.
        base_ms: u64,
        /// Cap.
        max_ms: u64,
    },
    /// `base_ms * factor^(attempts - 1)`, capped.
    Exponential {
        /// First delay.
        base_ms: u64,
        /// Growth factor.
        factor: f64,
        /// Cap.
        max_ms: u64,
    },
}

/// Retry policy for one task type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Tries before permanent failure.
    pub max_attempts: u32,
    /// Delay formula.
    pub backoff: BackoffConfig,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig::Exponential {
                base_ms: 60_000,
                factor: 2.0,
                max_ms: 3_600_000,
            },
        }
    }
}

impl RetryPolicyConfig {
    /// Runtime policy.
    #[must_use]
    pub const fn to_policy(&self) -> RetryPolicy {
        let backoff = match self.backoff {
            BackoffConfig::Linear { base_ms, max_ms } => Backoff::Linear {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
            },
            BackoffConfig::Exponential {
                base_ms,
                factor,
                max_ms,
            } => Backoff::Exponential {
                base: Duration::from_millis(base_ms),
                factor,
                max: Duration::from_millis(max_ms),
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff,
        }
    }
}

/// Default and per-type retry policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy for types without an override.
    pub default: RetryPolicyConfig,
    /// Overrides keyed by task type.
    pub per_type: HashMap<String, RetryPolicyConfig>,
}

impl RetryConfig {
    /// Validate every policy.
    ///
    /// # Errors
    ///
    /// Returns a message naming the invalid policy.
    pub fn validate(&self) -> Result<(), String> {
        self.default
            .to_policy()
            .validate()
            .map_err(|e| format!("default retry policy invalid: {e}"))?;
        for (task_type, policy) in &self.per_type {
            policy
                .to_policy()
                .validate()
                .map_err(|e| format!("retry policy for `{task_type}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Runtime policy set.
    #[must_use]
    pub fn to_policies(&self) -> RetryPolicies {
        self.per_type.iter().fold(
            RetryPolicies::new(self.default.to_policy()),
            |policies, (task_type, policy)| policies.with_type(task_type.clone(), policy.to_policy()),
        )
    }
}

/// Housekeeping cadence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    /// Seconds between passes.
    pub interval_secs: u64,
    /// Running tasks older than this are released.
    pub stale_after_secs: u64,
    /// Rate events older than this are pruned.
    pub rate_window_retention_secs: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            stale_after_secs: 15 * 60,
            rate_window_retention_secs: 24 * 3_600,
        }
    }
}

impl HousekeepingConfig {
    /// Validate housekeeping values.
    ///
    /// # Errors
    ///
    /// Returns a message describing the invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval_secs == 0 {
            return Err("housekeeping interval_secs must be greater than 0".into());
        }
        if self.stale_after_secs == 0 {
            return Err("stale_after_secs must be greater than 0".into());
        }
        Ok(())
    }

    /// Runtime settings.
    #[must_use]
    pub const fn settings(&self) -> HousekeepingSettings {
        HousekeepingSettings {
            interval: Duration::from_secs(self.interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            rate_window_retention: Duration::from_secs(self.rate_window_retention_secs),
        }
    }
}

/// Publishing slot configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Weekly slots, e.g. `"0:07:00,2:11:00"`.
    pub weekly: WeeklySchedule,
    /// Minutes east of UTC the slot times are expressed in.
    pub utc_offset_minutes: i32,
}

impl ScheduleConfig {
    /// Schedule with the offset applied.
    ///
    /// # Errors
    ///
    /// Returns a message if the offset is out of range.
    pub fn to_schedule(&self) -> Result<WeeklySchedule, String> {
        self.weekly
            .clone()
            .with_utc_offset_minutes(self.utc_offset_minutes)
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Storage backend.
    pub store: StoreBackendConfig,
    /// Worker loops.
    pub worker: WorkerConfig,
    /// Retry policies.
    pub retry: RetryConfig,
    /// Housekeeping cadence.
    pub housekeeping: HousekeepingConfig,
    /// Publishing slots.
    pub schedule: ScheduleConfig,
}

impl SchedulerConfig {
    /// Validate all sections.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first invalid section.
    pub fn validate(&self) -> Result<(), String> {
        self.worker.validate().map_err(|e| format!("worker invalid: {e}"))?;
        self.retry.validate()?;
        self.housekeeping
            .validate()
            .map_err(|e| format!("housekeeping invalid: {e}"))?;
        self.schedule
            .to_schedule()
            .map_err(|e| format!("schedule invalid: {e}"))?;
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env`, then the optional JSON file named by `SCHEDULER_CONFIG`,
    /// then the `SCHEDULER_*` and `WEEKLY_SCHEDULE` overrides.
    ///
    /// # Errors
    ///
    /// Returns a message for unreadable files or malformed values.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns a message for unreadable files or malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut cfg = match lookup("SCHEDULER_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| format!("cannot read {path}: {e}"))?;
                serde_json::from_str(&raw).map_err(|e| format!("parse error in {path}: {e}"))?
            }
            None => Self::default(),
        };
        if let Some(store) = lookup("SCHEDULER_STORE") {
            cfg.store = store.parse()?;
        }
        if let Some(ms) = lookup("SCHEDULER_POLL_INTERVAL_MS") {
            cfg.worker.poll_interval_ms = parse_var("SCHEDULER_POLL_INTERVAL_MS", &ms)?;
        }
        if let Some(n) = lookup("SCHEDULER_CONCURRENCY") {
            cfg.worker.concurrency = parse_var("SCHEDULER_CONCURRENCY", &n)?;
        }
        if let Some(slots) = lookup("WEEKLY_SCHEDULE").filter(|s| !s.trim().is_empty()) {
            cfg.schedule.weekly =
                WeeklySchedule::parse(&slots).map_err(|e| format!("WEEKLY_SCHEDULE: {e}"))?;
        }
        if let Some(minutes) = lookup("SCHEDULER_UTC_OFFSET_MINUTES") {
            cfg.schedule.utc_offset_minutes = parse_var("SCHEDULER_UTC_OFFSET_MINUTES", &minutes)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, String>
where
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{name}={value}: {e}"))
}
