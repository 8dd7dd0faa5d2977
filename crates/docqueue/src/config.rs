//! Settings for the processor, the priority calculation and the monitor.
//!
//! Every struct deserializes from environment variables through `envy`,
//! each with its own prefix, after an optional `.env` file has been loaded:
//!
//! | Struct              | Prefix               | Example                              |
//! |---------------------|----------------------|--------------------------------------|
//! | `ProcessorConfig`   | `DOCQUEUE_`          | `DOCQUEUE_MAX_WORKERS=8`             |
//! | `PriorityConfig`    | `DOCQUEUE_PRIORITY_` | `DOCQUEUE_PRIORITY_AGING_STEP=5`     |
//! | `MonitorThresholds` | `DOCQUEUE_MONITOR_`  | `DOCQUEUE_MONITOR_BACKLOG_WARNING=80`|
//!
//! ```ignore
//! use docqueue::config::Settings;
//!
//! let settings = Settings::from_env()?;
//! println!("workers: {}", settings.processor.max_workers);
//! ```

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable deserialization failed.
    #[error("Configuration error: {0}")]
    Envy(#[from] envy::Error),

    /// A value parsed but is out of range.
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl From<ConfigError> for crate::JobError {
    fn from(err: ConfigError) -> Self {
        crate::JobError::Config(err.to_string())
    }
}

fn from_env_prefixed<T: DeserializeOwned>(prefix: &str) -> Result<T, ConfigError> {
    envy::prefixed(prefix).from_env::<T>().map_err(ConfigError::from)
}

/// Load environment variables from a `.env` file, if one exists.
///
/// Existing environment variables take precedence over `.env` values.
pub fn load_dotenv() {
    let _ = dotenvy::dotenv();
}

/// Load environment variables from a specific file path.
pub fn load_dotenv_from<P: AsRef<std::path::Path>>(path: P) {
    let _ = dotenvy::from_path(path);
}

fn default_max_workers() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    2_000
}
fn default_retry_max_delay_ms() -> u64 {
    300_000
}
fn default_history_retention_days() -> u32 {
    30
}
fn default_finished_cache_size() -> usize {
    1_000
}

/// Worker pool and retry settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Default retry budget for submitted jobs.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles per subsequent retry.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Per-attempt execution limit. Expiry fails the job.
    #[serde(default)]
    pub job_timeout_ms: Option<u64>,
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,
    /// Terminal jobs kept in memory for status lookups.
    #[serde(default = "default_finished_cache_size")]
    pub finished_cache_size: usize,
    /// Directory for the file-backed store.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            job_timeout_ms: None,
            history_retention_days: default_history_retention_days(),
            finished_cache_size: default_finished_cache_size(),
            data_dir: None,
        }
    }
}

impl ProcessorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        from_env_prefixed::<Self>("DOCQUEUE_")?.validated()
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_retry_delay(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay_ms = base.as_millis() as u64;
        self.retry_max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = Some((timeout.as_millis() as u64).max(1));
        self
    }

    pub fn with_finished_cache_size(mut self, n: usize) -> Self {
        self.finished_cache_size = n;
        self
    }

    pub fn with_history_retention_days(mut self, days: u32) -> Self {
        self.history_retention_days = days;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff before the `retry_count`-th retry: base * 2^(retry_count - 1),
    /// capped at the configured maximum.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid {
                field: "max_workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry_base_delay_ms",
                reason: "must not exceed retry_max_delay_ms".to_string(),
            });
        }
        Ok(self)
    }
}

fn default_aging_interval_secs() -> u64 {
    60
}
fn default_aging_step() -> f64 {
    10.0
}
fn default_max_aging_bonus() -> f64 {
    150.0
}
fn default_retry_penalty_step() -> f64 {
    25.0
}
fn default_max_retry_penalty() -> f64 {
    100.0
}

/// Tuning for effective priority: aging bonus and retry penalty.
#[derive(Debug, Clone, Deserialize)]
pub struct PriorityConfig {
    /// Waiting time that earns one `aging_step`.
    #[serde(default = "default_aging_interval_secs")]
    pub aging_interval_secs: u64,
    #[serde(default = "default_aging_step")]
    pub aging_step: f64,
    #[serde(default = "default_max_aging_bonus")]
    pub max_aging_bonus: f64,
    #[serde(default = "default_retry_penalty_step")]
    pub retry_penalty_step: f64,
    #[serde(default = "default_max_retry_penalty")]
    pub max_retry_penalty: f64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            aging_interval_secs: default_aging_interval_secs(),
            aging_step: default_aging_step(),
            max_aging_bonus: default_max_aging_bonus(),
            retry_penalty_step: default_retry_penalty_step(),
            max_retry_penalty: default_max_retry_penalty(),
        }
    }
}

impl PriorityConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        from_env_prefixed::<Self>("DOCQUEUE_PRIORITY_")?.validated()
    }

    pub fn with_aging(mut self, interval: Duration, step: f64, max_bonus: f64) -> Self {
        self.aging_interval_secs = interval.as_secs().max(1);
        self.aging_step = step;
        self.max_aging_bonus = max_bonus;
        self
    }

    pub fn with_retry_penalty(mut self, step: f64, max_penalty: f64) -> Self {
        self.retry_penalty_step = step;
        self.max_retry_penalty = max_penalty;
        self
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.aging_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "aging_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        for (field, value) in [
            ("aging_step", self.aging_step),
            ("max_aging_bonus", self.max_aging_bonus),
            ("retry_penalty_step", self.retry_penalty_step),
            ("max_retry_penalty", self.max_retry_penalty),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must be a non-negative number, got {}", value),
                });
            }
        }
        Ok(self)
    }
}

fn default_backlog_warning() -> usize {
    50
}
fn default_backlog_critical() -> usize {
    200
}
fn default_queue_age_warning_secs() -> u64 {
    600
}
fn default_queue_age_critical_secs() -> u64 {
    1_800
}
fn default_failure_rate_warning() -> f64 {
    10.0
}
fn default_failure_rate_critical() -> f64 {
    25.0
}
fn default_failure_window_hours() -> u32 {
    24
}

/// Thresholds used by [`crate::QueueMonitor::check_queue_health`].
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorThresholds {
    #[serde(default = "default_backlog_warning")]
    pub backlog_warning: usize,
    #[serde(default = "default_backlog_critical")]
    pub backlog_critical: usize,
    #[serde(default = "default_queue_age_warning_secs")]
    pub queue_age_warning_secs: u64,
    #[serde(default = "default_queue_age_critical_secs")]
    pub queue_age_critical_secs: u64,
    /// Percent of finished jobs that failed.
    #[serde(default = "default_failure_rate_warning")]
    pub failure_rate_warning: f64,
    #[serde(default = "default_failure_rate_critical")]
    pub failure_rate_critical: f64,
    #[serde(default = "default_failure_window_hours")]
    pub failure_window_hours: u32,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            backlog_warning: default_backlog_warning(),
            backlog_critical: default_backlog_critical(),
            queue_age_warning_secs: default_queue_age_warning_secs(),
            queue_age_critical_secs: default_queue_age_critical_secs(),
            failure_rate_warning: default_failure_rate_warning(),
            failure_rate_critical: default_failure_rate_critical(),
            failure_window_hours: default_failure_window_hours(),
        }
    }
}

impl MonitorThresholds {
    pub fn from_env() -> Result<Self, ConfigError> {
        from_env_prefixed("DOCQUEUE_MONITOR_")
    }

    pub fn with_backlog(mut self, warning: usize, critical: usize) -> Self {
        self.backlog_warning = warning;
        self.backlog_critical = critical;
        self
    }

    pub fn with_queue_age(mut self, warning: Duration, critical: Duration) -> Self {
        self.queue_age_warning_secs = warning.as_secs();
        self.queue_age_critical_secs = critical.as_secs();
        self
    }

    pub fn with_failure_rate(mut self, warning: f64, critical: f64) -> Self {
        self.failure_rate_warning = warning;
        self.failure_rate_critical = critical;
        self
    }
}

/// All settings, loaded together at startup.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub processor: ProcessorConfig,
    pub priority: PriorityConfig,
    pub monitor: MonitorThresholds,
}

impl Settings {
    /// Loads `.env` (if present) and then reads every prefixed section.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Ok(Self {
            processor: ProcessorConfig::from_env()?,
            priority: PriorityConfig::from_env()?,
            monitor: MonitorThresholds::from_env()?,
        })
    }
}
