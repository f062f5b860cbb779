//! Task abstractions
//!
//! A task is a typed, prioritized unit of work. Handlers receive a
//! [`TaskContext`] per attempt and return a JSON result or a [`TaskError`].

mod context;
mod handler;
mod in_flight;
mod model;

pub use context::TaskContext;
pub use handler::{TaskError, TaskHandler};
pub use in_flight::InFlightTasks;
pub use model::{
    InvalidPriority, ScheduleOptions, Task, TaskFailure, TaskFailureKind, TaskFilter, TaskId,
    TaskOutcome, TaskPriority, TaskStatus, DEFAULT_MAX_ATTEMPTS, DEFAULT_TASK_TIMEOUT,
};
