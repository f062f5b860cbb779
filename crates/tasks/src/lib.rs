//! # Castplan task engine
//!
//! A store-backed asynchronous task engine. Callers schedule typed units of
//! work with a priority, retry policy, timeout and optional dependencies; a
//! pool of poll loops claims due work from per-priority queues, runs it
//! against registered handlers and writes the outcome back to the store.
//!
//! ## Features
//!
//! - **Priority queues**: critical, high, medium and low classes, earliest
//!   scheduled first within a class
//! - **Delays and dependencies**: tasks become eligible at their scheduled time
//!   and once every dependency has completed
//! - **Retries**: a per-attempt delay ladder with a terminal summary once
//!   attempts run out
//! - **Timeouts and cooperative cancellation** through [`TaskContext`]
//! - **Heartbeats**: running tasks of dead workers are reported as abandoned
//! - **Events and statistics**: an ordered event stream and periodic snapshots
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskEngine                            │
//! │  TaskScheduler ─ EventBus ─ StatisticsCollector ─ Monitor   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskStore                             │
//! │  task:{id}   queue:{priority}   running   worker:{id}       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (poll loops, concurrency limiter, heartbeats)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use castplan_tasks::prelude::*;
//!
//! let engine = TaskEngine::in_memory(EngineConfig::from_env())?;
//! engine.register_handler("transcode", |ctx: TaskContext| async move {
//!     let job: TranscodeJob = ctx.payload_as()?;
//!     Ok(json!({ "output": transcode(job).await? }))
//! });
//!
//! engine.start().await?;
//! let task = engine
//!     .schedule_task("transcode", json!({"src": "a.mov"}), ScheduleOptions::new())
//!     .await?;
//! // ...
//! engine.stop().await?;
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod telemetry;
pub mod worker;

mod serde_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, EngineConfig};
    pub use crate::engine::TaskEngine;
    pub use crate::events::{EventSubscription, TaskEvent, TaskEventKind};
    pub use crate::persistence::{InMemoryTaskStore, StoreError, TaskStore};
    pub use crate::scheduler::SchedulerError;
    pub use crate::stats::StatsSnapshot;
    pub use crate::task::{
        ScheduleOptions, Task, TaskContext, TaskError, TaskFilter, TaskHandler, TaskId,
        TaskOutcome, TaskPriority, TaskStatus,
    };
    pub use crate::worker::WorkerPoolError;
}

// Re-export key types at crate root
pub use config::{ConfigError, EngineConfig};
pub use engine::TaskEngine;
pub use events::{EventBus, EventSubscription, TaskEvent, TaskEventKind};
pub use persistence::{InMemoryTaskStore, StoreError, TaskStore};
pub use queue::TaskQueue;
pub use reliability::RetryLadder;
pub use scheduler::{AbandonedTask, QueueStatus, SchedulerError};
pub use stats::StatsSnapshot;
pub use task::{
    ScheduleOptions, Task, TaskContext, TaskError, TaskFailure, TaskFailureKind, TaskFilter,
    TaskHandler, TaskId, TaskOutcome, TaskPriority, TaskStatus,
};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
