//! Reliability patterns
//!
//! This module provides:
//! - [`RetryLadder`] - Per-attempt retry delays

mod retry;

pub use retry::RetryLadder;
