//! Engine configuration
//!
//! Defaults suit a single process handling a few tasks at a time. Every
//! option can be set through the `with_*` builders or from `TASKS_*`
//! environment variables via [`EngineConfig::from_env`].

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::reliability::RetryLadder;
use crate::scheduler::MAX_SCHEDULE_DELAY;
use crate::serde_util::{duration_millis, option_duration_millis};
use crate::task::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TASK_TIMEOUT};

/// Extra grace on top of the task timeout when stopping the pool
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of poll loops
    pub concurrency: usize,

    /// Process-wide cap on executing tasks (defaults to `concurrency`)
    pub max_in_flight: Option<usize>,

    /// Poll cadence while work is flowing
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Upper bound for idle and error backoff
    #[serde(with = "duration_millis")]
    pub max_poll_interval: Duration,

    /// Idle time after which a loop starts backing off
    #[serde(with = "duration_millis")]
    pub max_idle_time: Duration,

    pub idle_backoff_multiplier: f64,

    /// Per-attempt timeout when the task does not set one
    #[serde(with = "duration_millis")]
    pub task_timeout: Duration,

    pub retry_delays: RetryLadder,

    pub default_max_attempts: u32,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Expiry of a worker heartbeat record
    #[serde(with = "duration_millis")]
    pub heartbeat_ttl: Duration,

    #[serde(with = "duration_millis")]
    pub stats_interval: Duration,

    /// Trailing window for processing time and throughput
    #[serde(with = "duration_millis")]
    pub stats_window: Duration,

    /// Bound on `stop()` (defaults to `task_timeout` + 5s)
    #[serde(with = "option_duration_millis")]
    pub shutdown_timeout: Option<Duration>,

    /// Reject unregistered task types at schedule time
    pub strict_handlers: bool,

    /// Buffered events per subscriber
    pub event_capacity: usize,

    #[serde(with = "duration_millis")]
    pub abandoned_check_interval: Duration,

    /// Prefix of worker ids; loops are named `{prefix}-{n}`
    pub worker_id_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_in_flight: None,
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(30),
            idle_backoff_multiplier: 1.5,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            retry_delays: RetryLadder::default(),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_ttl: Duration::from_secs(30),
            stats_interval: Duration::from_secs(30),
            stats_window: Duration::from_secs(300),
            shutdown_timeout: None,
            strict_handlers: false,
            event_capacity: 1024,
            abandoned_check_interval: Duration::from_secs(60),
            worker_id_prefix: default_worker_prefix(),
        }
    }
}

fn default_worker_prefix() -> String {
    let id = Uuid::now_v7().simple().to_string();
    format!("worker-{}", &id[id.len() - 8..])
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from `TASKS_*` environment variables
    ///
    /// Unset variables keep their defaults. Unparseable values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let env = EnvReader { lookup };

        if let Some(v) = env.parse("TASKS_CONCURRENCY") {
            config.concurrency = v;
        }
        if let Some(v) = env.parse("TASKS_MAX_IN_FLIGHT") {
            config.max_in_flight = Some(v);
        }
        if let Some(v) = env.millis("TASKS_POLL_INTERVAL_MS") {
            config.poll_interval = v;
        }
        if let Some(v) = env.millis("TASKS_MAX_POLL_INTERVAL_MS") {
            config.max_poll_interval = v;
        }
        if let Some(v) = env.millis("TASKS_MAX_IDLE_TIME_MS") {
            config.max_idle_time = v;
        }
        if let Some(v) = env.parse("TASKS_IDLE_BACKOFF_MULTIPLIER") {
            config.idle_backoff_multiplier = v;
        }
        if let Some(v) = env.millis("TASKS_TASK_TIMEOUT_MS") {
            config.task_timeout = v;
        }
        if let Some(v) = env.millis_list("TASKS_RETRY_DELAYS_MS") {
            config.retry_delays = RetryLadder::new(v);
        }
        if let Some(v) = env.parse("TASKS_DEFAULT_MAX_ATTEMPTS") {
            config.default_max_attempts = v;
        }
        if let Some(v) = env.millis("TASKS_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = v;
        }
        if let Some(v) = env.millis("TASKS_HEARTBEAT_TTL_MS") {
            config.heartbeat_ttl = v;
        }
        if let Some(v) = env.millis("TASKS_STATS_INTERVAL_MS") {
            config.stats_interval = v;
        }
        if let Some(v) = env.millis("TASKS_STATS_WINDOW_MS") {
            config.stats_window = v;
        }
        if let Some(v) = env.millis("TASKS_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = Some(v);
        }
        if let Some(v) = env.flag("TASKS_STRICT_HANDLERS") {
            config.strict_handlers = v;
        }
        if let Some(v) = env.parse("TASKS_EVENT_CAPACITY") {
            config.event_capacity = v;
        }
        if let Some(v) = env.millis("TASKS_ABANDONED_CHECK_INTERVAL_MS") {
            config.abandoned_check_interval = v;
        }
        if let Some(v) = env.raw("TASKS_WORKER_ID_PREFIX") {
            config.worker_id_prefix = v;
        }

        config
    }

    /// Check option consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.max_in_flight == Some(0) {
            return Err(ConfigError::Invalid("max_in_flight must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval must be positive".into()));
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(ConfigError::Invalid(
                "max_poll_interval must be at least poll_interval".into(),
            ));
        }
        if self.idle_backoff_multiplier.is_nan() || self.idle_backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "idle_backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if self.task_timeout.is_zero() {
            return Err(ConfigError::Invalid("task_timeout must be positive".into()));
        }
        if self
            .retry_delays
            .delays()
            .iter()
            .any(|delay| *delay > MAX_SCHEDULE_DELAY)
        {
            return Err(ConfigError::Invalid(format!(
                "retry_delays entries must not exceed {}s",
                MAX_SCHEDULE_DELAY.as_secs()
            )));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "default_max_attempts must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeat_interval must be positive".into()));
        }
        if self.heartbeat_ttl <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(
                "heartbeat_ttl must exceed heartbeat_interval".into(),
            ));
        }
        if self.stats_interval.is_zero() || self.stats_window.is_zero() {
            return Err(ConfigError::Invalid(
                "stats_interval and stats_window must be positive".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".into()));
        }
        if self.abandoned_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "abandoned_check_interval must be positive".into(),
            ));
        }
        if self.worker_id_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid("worker_id_prefix must not be empty".into()));
        }
        Ok(())
    }

    /// Limiter capacity
    pub fn effective_max_in_flight(&self) -> usize {
        self.max_in_flight.unwrap_or(self.concurrency)
    }

    /// Bound on `stop()`
    pub fn effective_shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
            .unwrap_or(self.task_timeout + SHUTDOWN_GRACE)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn with_idle_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.idle_backoff_multiplier = multiplier;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = RetryLadder::new(delays);
        self
    }

    pub fn with_default_max_attempts(mut self, attempts: u32) -> Self {
        self.default_max_attempts = attempts;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, ttl: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_ttl = ttl;
        self
    }

    pub fn with_stats(mut self, interval: Duration, window: Duration) -> Self {
        self.stats_interval = interval;
        self.stats_window = window;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn with_strict_handlers(mut self, strict: bool) -> Self {
        self.strict_handlers = strict;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn with_abandoned_check_interval(mut self, interval: Duration) -> Self {
        self.abandoned_check_interval = interval;
        self
    }

    pub fn with_worker_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_id_prefix = prefix.into();
        self
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, name: &str) -> Option<T> {
        let raw = self.raw(name)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(variable = name, value = %raw, "Ignoring unparseable configuration value");
                None
            }
        }
    }

    fn millis(&self, name: &str) -> Option<Duration> {
        self.parse::<u64>(name).map(Duration::from_millis)
    }

    fn millis_list(&self, name: &str) -> Option<Vec<Duration>> {
        let raw = self.raw(name)?;
        let parsed: Result<Vec<u64>, _> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect();
        match parsed {
            Ok(millis) => Some(millis.into_iter().map(Duration::from_millis).collect()),
            Err(_) => {
                warn!(variable = name, value = %raw, "Ignoring unparseable delay list");
                None
            }
        }
    }

    fn flag(&self, name: &str) -> Option<bool> {
        let raw = self.raw(name)?;
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                warn!(variable = name, value = %raw, "Ignoring unparseable flag");
                None
            }
        }
    }
}
