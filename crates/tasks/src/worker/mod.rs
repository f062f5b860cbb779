//! Worker pool and task execution
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        WorkerPool                         │
//! │  ┌────────────┐ ┌────────────┐       ┌────────────┐       │
//! │  │ WorkerLoop │ │ WorkerLoop │  ...  │ WorkerLoop │       │
//! │  │ + heartbeat│ │ + heartbeat│       │ + heartbeat│       │
//! │  └─────┬──────┘ └─────┬──────┘       └─────┬──────┘       │
//! │        └──────────────┼────────────────────┘              │
//! │                       ▼                                   │
//! │              ConcurrencyLimiter (max_in_flight)           │
//! │                       ▼                                   │
//! │     peek ─► claim ─► running ─► handler ─► outcome        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each loop polls on its own [`PollCadence`], holds a limiter slot while it
//! executes and keeps a `worker:{id}` heartbeat alive. The
//! [`AbandonedTaskMonitor`] reports running tasks whose worker went away.

mod executor;
mod heartbeat;
mod limiter;
mod monitor;
mod poller;
mod pool;

pub use heartbeat::{Heartbeat, WorkerRecord};
pub use limiter::{ConcurrencyLimiter, LimiterError, LimiterPermit};
pub use monitor::AbandonedTaskMonitor;
pub use poller::{PollCadence, PollerConfig};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
