//! Task execution context

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::handler::TaskError;
use super::model::{Task, TaskId};

/// Context handed to a handler for one attempt
///
/// Carries a snapshot of the task record, the attempt number and a
/// cancellation token. The token fires when the attempt times out or the
/// task is cancelled while running. Handlers are expected to observe it;
/// the engine never aborts a running handler.
///
/// # Example
///
/// ```ignore
/// async fn render(ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
///     let input: RenderInput = ctx.payload_as()?;
///     tokio::select! {
///         out = do_render(input) => Ok(serde_json::to_value(out)?),
///         _ = ctx.cancelled() => Err(TaskError::non_retryable("cancelled")),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Task,

    /// Poll loop executing the attempt
    pub worker_id: String,

    cancellation: CancellationToken,
}

impl TaskContext {
    pub fn new(task: Task, worker_id: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            task,
            worker_id: worker_id.into(),
            cancellation,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.task.payload
    }

    /// Deserialize the payload into a typed input
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        serde_json::from_value(self.task.payload.clone()).map_err(|e| {
            TaskError::non_retryable(format!("invalid payload for '{}': {e}", self.task.task_type))
        })
    }

    /// Current attempt number (1-based)
    pub fn attempt(&self) -> u32 {
        self.task.attempts
    }

    pub fn is_last_attempt(&self) -> bool {
        self.task.attempts >= self.task.max_attempts
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the attempt is cancelled or timed out
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }
}
