//! Abandoned task monitor
//!
//! Periodically looks for running tasks whose worker heartbeat has expired
//! and reports each one once. Abandoned tasks are left as they are.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, TaskEventKind};
use crate::scheduler::{AbandonedTask, SchedulerError, TaskScheduler};
use crate::task::TaskId;

pub struct AbandonedTaskMonitor {
    scheduler: Arc<TaskScheduler>,
    events: EventBus,
    reported: HashSet<TaskId>,
}

impl AbandonedTaskMonitor {
    pub fn new(scheduler: Arc<TaskScheduler>, events: EventBus) -> Self {
        Self {
            scheduler,
            events,
            reported: HashSet::new(),
        }
    }

    /// Run one check and return the tasks reported for the first time
    pub async fn check(&mut self) -> Result<Vec<AbandonedTask>, SchedulerError> {
        let abandoned = self.scheduler.find_abandoned_tasks().await?;

        let current: HashSet<TaskId> = abandoned.iter().map(|t| t.task_id).collect();
        self.reported.retain(|id| current.contains(id));

        let mut fresh = Vec::new();
        for task in abandoned {
            if !self.reported.insert(task.task_id) {
                continue;
            }
            warn!(
                task_id = %task.task_id,
                task_type = %task.task_type,
                worker_id = %task.worker_id,
                attempt = task.attempt,
                "Task abandoned by dead worker"
            );
            self.events.emit(TaskEventKind::TaskAbandoned {
                task_id: task.task_id,
                worker_id: task.worker_id.clone(),
            });
            fresh.push(task);
        }
        Ok(fresh)
    }

    pub fn spawn(mut self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.check().await {
                            warn!(error = %e, "Abandoned task check failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Abandoned task monitor stopped");
                        break;
                    }
                }
            }
        })
    }
}
