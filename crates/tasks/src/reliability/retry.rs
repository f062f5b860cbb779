//! Retry backoff ladder

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::serde_util::duration_vec_millis;

/// Delays applied between attempts of a failing task
///
/// The delay after attempt `n` is `delays[min(n - 1, len - 1)]`, so the last
/// step repeats for every further retry.
///
/// # Example
///
/// ```
/// use castplan_tasks::RetryLadder;
/// use std::time::Duration;
///
/// let ladder = RetryLadder::new(vec![
///     Duration::from_secs(1),
///     Duration::from_secs(10),
/// ]);
///
/// assert_eq!(ladder.delay_for_attempt(1), Duration::from_secs(1));
/// assert_eq!(ladder.delay_for_attempt(2), Duration::from_secs(10));
/// assert_eq!(ladder.delay_for_attempt(7), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryLadder {
    delays: Vec<Duration>,
}

impl Serialize for RetryLadder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        duration_vec_millis::serialize(&self.delays, serializer)
    }
}

impl<'de> Deserialize<'de> for RetryLadder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        duration_vec_millis::deserialize(deserializer).map(Self::new)
    }
}

impl Default for RetryLadder {
    /// 1s, 5s, 30s
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
        }
    }
}

impl RetryLadder {
    /// Build a ladder. An empty list retries immediately.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// Same delay before every retry
    pub fn fixed(delay: Duration) -> Self {
        Self::new(vec![delay])
    }

    /// Delay to wait after the given (1-based) attempt failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(last) = self.delays.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = (attempt.saturating_sub(1) as usize).min(last);
        self.delays[index]
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}
