//! Poll cadence with idle and error backoff
//!
//! Each poll loop owns a [`PollCadence`]. While work flows the loop polls
//! every `poll_interval`. Once it has been idle for `max_idle_time` the
//! interval grows by `idle_backoff_multiplier` per empty poll, up to
//! `max_poll_interval`. Store errors back off exponentially with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::serde_util::duration_millis;

/// Cadence configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    #[serde(with = "duration_millis")]
    pub max_poll_interval: Duration,

    /// Idle time before backoff kicks in
    #[serde(with = "duration_millis")]
    pub max_idle_time: Duration,

    pub idle_backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0) applied to error backoff
    pub error_jitter: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(5),
            max_idle_time: Duration::from_secs(30),
            idle_backoff_multiplier: 1.5,
            error_jitter: 0.2,
        }
    }
}

impl PollerConfig {
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
        self.idle_backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Per-loop polling state
#[derive(Debug)]
pub struct PollCadence {
    config: PollerConfig,
    current_interval: Duration,
    idle_since: Option<Instant>,
    consecutive_errors: u32,
}

impl PollCadence {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            current_interval: config.poll_interval,
            config,
            idle_since: None,
            consecutive_errors: 0,
        }
    }

    /// A task was claimed: back to the base interval
    pub fn record_work(&mut self) {
        self.current_interval = self.config.poll_interval;
        self.idle_since = None;
        self.consecutive_errors = 0;
    }

    /// The queue had nothing for us
    pub fn record_idle(&mut self) {
        self.consecutive_errors = 0;
        let now = Instant::now();
        let idle_since = *self.idle_since.get_or_insert(now);

        if now.duration_since(idle_since) >= self.config.max_idle_time {
            let next = self
                .current_interval
                .mul_f64(self.config.idle_backoff_multiplier);
            self.current_interval = next.min(self.config.max_poll_interval);
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "Idle, backing off"
            );
        }
    }

    /// The store failed: exponential backoff with jitter
    pub fn record_error(&mut self) {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        let exponent = self.consecutive_errors.min(16);
        let base = self
            .config
            .poll_interval
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_poll_interval);

        let jitter = self.config.error_jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        self.current_interval = base.mul_f64(factor).min(self.config.max_poll_interval);
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Sleep for the current interval. Returns true if shutdown fired first.
    pub async fn wait(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown.cancelled() => true,
        }
    }
}
