//! Handler trait and handler errors

use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::TaskContext;

/// Error returned by a handler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub message: String,

    /// Non-retryable errors fail the task without further attempts
    pub retryable: bool,

    /// Extra debugging data, logged with the failure
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(err.to_string())
    }
}

/// Executes tasks of one type
///
/// Implemented for any `Fn(TaskContext) -> impl Future<Output = Result<Value, TaskError>>`,
/// so plain async closures can be registered directly:
///
/// ```ignore
/// engine.register_handler("echo", |ctx: TaskContext| async move {
///     Ok(ctx.payload().clone())
/// });
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, TaskError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, TaskError> {
        (self)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_constructors() {
        let error = TaskError::retryable("connection reset");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "connection reset");

        let error = TaskError::non_retryable("bad input").with_details(serde_json::json!({"field": "fps"}));
        assert!(!error.retryable);
        assert!(error.details.is_some());
    }

    #[test]
    fn test_task_error_from_anyhow_is_retryable() {
        let error: TaskError = anyhow::anyhow!("upstream 503").into();
        assert!(error.retryable);
        assert!(error.message.contains("503"));
    }
}
