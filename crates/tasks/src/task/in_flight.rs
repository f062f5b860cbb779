//! Cancellation tokens of attempts running in this process

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::model::TaskId;

/// Tracks the cancellation token of every attempt executing locally
///
/// Shared by the scheduler (which cancels) and the worker pool (which
/// registers and clears).
#[derive(Debug, Default)]
pub struct InFlightTasks {
    tokens: DashMap<TaskId, CancellationToken>,
}

impl InFlightTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for an attempt
    pub fn register(&self, task_id: TaskId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(task_id, token.clone());
        token
    }

    /// Fire the token of a running attempt. Returns false if none is local.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.tokens.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, task_id: TaskId) {
        self.tokens.remove(&task_id);
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tokens.contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
