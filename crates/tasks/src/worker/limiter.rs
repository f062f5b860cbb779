//! Process-wide concurrency limiter
//!
//! A semaphore caps how many tasks execute at once across every poll loop,
//! with atomic counters for load reporting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Limiter errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum LimiterError {
    #[error("concurrency limiter closed")]
    Closed,
}

/// Caps concurrent task execution
///
/// # Example
///
/// ```
/// use castplan_tasks::worker::ConcurrencyLimiter;
///
/// let limiter = ConcurrencyLimiter::new(2);
/// let permit = limiter.try_acquire().unwrap();
/// assert_eq!(limiter.in_flight(), 1);
/// drop(permit);
/// assert_eq!(limiter.in_flight(), 0);
/// ```
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    counters: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a free slot
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        Ok(self.track(permit))
    }

    /// Take a slot if one is free right now
    pub fn try_acquire(&self) -> Option<LimiterPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(self.track(permit))
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> LimiterPermit {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        LimiterPermit {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    /// Tasks currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Highest `in_flight` observed since creation
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Load ratio (0.0 - 1.0)
    pub fn load_ratio(&self) -> f64 {
        self.in_flight() as f64 / self.max_in_flight as f64
    }
}

/// A held slot; released on drop
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
