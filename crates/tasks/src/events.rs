//! Lifecycle events broadcast by the engine
//!
//! Every state transition produces one [`TaskEvent`]. Subscribers receive
//! events in sequence order; a subscriber that falls behind the channel
//! capacity skips ahead and sees a gap in `seq`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use crate::stats::StatsSnapshot;
use crate::task::{TaskId, TaskPriority};

/// A structured event emitted by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Monotonic per-engine sequence number
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventKind {
    TaskScheduled {
        task_id: TaskId,
        task_type: String,
        priority: TaskPriority,
        scheduled_at: DateTime<Utc>,
    },
    TaskStarted {
        task_id: TaskId,
        task_type: String,
        worker_id: String,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        task_type: String,
        attempts: u32,
        duration_ms: u64,
    },
    TaskRetrying {
        task_id: TaskId,
        task_type: String,
        attempt: u32,
        error: String,
        delay_ms: u64,
        retry_at: DateTime<Utc>,
    },
    TaskFailed {
        task_id: TaskId,
        task_type: String,
        attempts: u32,
        error: String,
    },
    TaskCancelled {
        task_id: TaskId,
        was_running: bool,
    },
    /// Running task whose worker stopped heartbeating
    TaskAbandoned {
        task_id: TaskId,
        worker_id: String,
    },
    StatsSnapshot {
        stats: StatsSnapshot,
    },
}

impl TaskEventKind {
    /// Task the event is about, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskScheduled { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskRetrying { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id, .. }
            | Self::TaskAbandoned { task_id, .. } => Some(*task_id),
            Self::StatsSnapshot { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskRetrying { .. } => "task_retrying",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskCancelled { .. } => "task_cancelled",
            Self::TaskAbandoned { .. } => "task_abandoned",
            Self::StatsSnapshot { .. } => "stats_snapshot",
        }
    }
}

/// Fan-out of engine events to any number of subscribers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
    seq: Arc<Mutex<u64>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: Arc::new(Mutex::new(0)),
        }
    }

    /// Stamp and broadcast an event
    ///
    /// Sequence assignment and send happen under one lock so subscribers
    /// observe `seq` in increasing order.
    pub fn emit(&self, kind: TaskEventKind) -> TaskEvent {
        let mut seq = self.seq.lock();
        *seq += 1;
        let event = TaskEvent {
            seq: *seq,
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Receiving end of the event bus. Dropping it unsubscribes.
#[derive(Debug)]
pub struct EventSubscription {
    receiver: broadcast::Receiver<TaskEvent>,
}

impl EventSubscription {
    /// Next event, or `None` once the engine is gone
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipping ahead");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, skipping ahead");
                }
                Err(_) => return None,
            }
        }
    }
}
