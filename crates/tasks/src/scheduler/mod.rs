//! Scheduler: task creation, cancellation and queries
//!
//! The scheduler owns task records up to the point a worker claims them.
//! After that the worker pool drives the lifecycle; cancellation is the one
//! mutation both sides may race on, and compare-and-set settles it.

mod registry;
mod validation;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::events::{EventBus, TaskEventKind};
use crate::persistence::keys::worker_key;
use crate::persistence::{RecordUpdate, StoreError, TaskRecords, TaskStore};
use crate::queue::TaskQueue;
use crate::task::{
    InFlightTasks, ScheduleOptions, Task, TaskFilter, TaskId, TaskOutcome, TaskPriority,
    TaskStatus,
};

pub use registry::HandlerRegistry;
pub use validation::{ScheduleDefaults, MAX_SCHEDULE_DELAY};

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Rejected input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unregistered type with strict handler checking on
    #[error("no handler registered for task type: {0}")]
    HandlerNotRegistered(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Queued members per class
    pub depth: BTreeMap<TaskPriority, usize>,
    pub total_queued: usize,
    /// Tasks in the shared running index, oldest attempt first
    pub running: Vec<TaskId>,
    /// Attempts executing in this process
    pub in_flight_local: usize,
}

/// A running task whose worker is no longer heartbeating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbandonedTask {
    pub task_id: TaskId,
    pub task_type: String,
    pub worker_id: String,
    pub attempt: u32,
    pub attempt_started_at: Option<DateTime<Utc>>,
}

/// Creates, cancels and queries tasks
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    records: TaskRecords,
    queue: TaskQueue,
    registry: Arc<HandlerRegistry>,
    in_flight: Arc<InFlightTasks>,
    events: EventBus,
    defaults: ScheduleDefaults,
    strict_handlers: bool,
}

impl TaskScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        in_flight: Arc<InFlightTasks>,
        events: EventBus,
        defaults: ScheduleDefaults,
        strict_handlers: bool,
    ) -> Self {
        Self {
            records: TaskRecords::new(store.clone()),
            queue: TaskQueue::new(store.clone()),
            store,
            registry,
            in_flight,
            events,
            defaults,
            strict_handlers,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Create a pending task and enqueue it
    ///
    /// The record is written before the queue entry. If the queue write
    /// fails the record is deleted again and the error returned.
    #[instrument(skip(self, payload, options), fields(task_type = %task_type))]
    pub async fn schedule_task(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: ScheduleOptions,
    ) -> Result<Task, SchedulerError> {
        let resolved = validation::validate(task_type, &options, &self.defaults)?;

        if self.strict_handlers && !self.registry.contains(task_type) {
            return Err(SchedulerError::HandlerNotRegistered(task_type.to_string()));
        }

        for dep in &options.dependencies {
            if self.records.get(*dep).await?.is_none() {
                return Err(SchedulerError::Validation(format!(
                    "dependency {dep} does not exist"
                )));
            }
        }

        let delay = chrono::Duration::from_std(resolved.delay)
            .map_err(|e| SchedulerError::Validation(format!("delay out of range: {e}")))?;

        let mut task = Task::new(task_type, payload);
        task.priority = resolved.priority;
        task.max_attempts = resolved.max_attempts;
        task.timeout = resolved.timeout;
        task.tags = options.tags;
        task.metadata = options.metadata.unwrap_or(serde_json::Value::Null);
        task.dependencies = options.dependencies;
        let scheduled_at = task.created_at + delay;
        task.scheduled_at = Some(scheduled_at);

        self.records.put(&task).await?;

        if let Err(e) = self
            .queue
            .add_to_queue(task.id, task.priority, scheduled_at)
            .await
        {
            if let Err(rollback) = self.records.delete(task.id).await {
                error!(task_id = %task.id, error = %rollback, "Failed to roll back task record");
            }
            return Err(e.into());
        }

        self.events.emit(TaskEventKind::TaskScheduled {
            task_id: task.id,
            task_type: task.task_type.clone(),
            priority: task.priority,
            scheduled_at,
        });

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            delay_ms = resolved.delay.as_millis() as u64,
            dependencies = task.dependencies.len(),
            "Task scheduled"
        );

        Ok(task)
    }

    /// Cancel a task
    ///
    /// Returns true when a queued task was cancelled. A running task is
    /// marked cancelled and its handler's token fired, but the call returns
    /// false because the attempt may still finish its side effects.
    /// Terminal tasks are left alone.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool, SchedulerError> {
        let now = Utc::now();
        let mut previous = None;

        let update = self
            .records
            .update(task_id, |task| {
                previous = Some(task.status);
                if !task.status.can_transition_to(TaskStatus::Cancelled) {
                    return false;
                }
                task.status = TaskStatus::Cancelled;
                task.completed_at.get_or_insert(now);
                task.next_attempt_at = None;
                true
            })
            .await?;

        match update {
            RecordUpdate::NotFound => Err(SchedulerError::NotFound(task_id)),
            RecordUpdate::Unchanged(task) => {
                debug!(task_id = %task_id, status = %task.status, "Cancel ignored for terminal task");
                Ok(false)
            }
            RecordUpdate::Updated(_) => {
                let was_running = previous == Some(TaskStatus::Running);

                if was_running {
                    let signalled = self.in_flight.cancel(task_id);
                    info!(task_id = %task_id, signalled, "Running task marked cancelled");
                } else {
                    self.queue.remove_from_queue(task_id).await?;
                    info!(task_id = %task_id, "Task cancelled");
                }

                self.events.emit(TaskEventKind::TaskCancelled {
                    task_id,
                    was_running,
                });
                Ok(!was_running)
            }
        }
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, SchedulerError> {
        self.records
            .get(task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))
    }

    /// Terminal outcome, or `None` while the task is still live
    pub async fn get_task_result(
        &self,
        task_id: TaskId,
    ) -> Result<Option<TaskOutcome>, SchedulerError> {
        Ok(self.get_task(task_id).await?.outcome())
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus, SchedulerError> {
        let depth = self.queue.depth_by_priority().await?;
        let total_queued = depth.values().sum();
        let running = self.queue.running_ids().await?;

        Ok(QueueStatus {
            depth,
            total_queued,
            running,
            in_flight_local: self.in_flight.len(),
        })
    }

    /// Tasks matching `filter`, oldest first
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        let mut tasks: Vec<Task> = self
            .records
            .scan()
            .await?
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    /// Delete terminal records that finished more than `older_than_hours` ago
    ///
    /// Records still named as a dependency by an unfinished task are kept,
    /// since the queue gates dependents on the dependency record's status.
    #[instrument(skip(self))]
    pub async fn cleanup_completed_tasks(
        &self,
        older_than_hours: u64,
    ) -> Result<usize, SchedulerError> {
        let hours = i64::try_from(older_than_hours).unwrap_or(i64::MAX);
        let cutoff = chrono::Duration::try_hours(hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let tasks = self.records.scan().await?;
        let still_needed: HashSet<TaskId> = tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .flat_map(|t| t.dependencies.iter().copied())
            .collect();

        let mut removed = 0;
        let mut kept = 0;
        for task in tasks {
            if !task.is_terminal() {
                continue;
            }
            if still_needed.contains(&task.id) {
                kept += 1;
                continue;
            }
            let Some(completed_at) = task.completed_at else {
                continue;
            };
            if completed_at >= cutoff {
                continue;
            }

            if self.records.delete(task.id).await? {
                removed += 1;
            }
            self.queue.remove_from_queue(task.id).await?;
            self.queue.clear_running(task.id).await?;
        }

        info!(removed, kept, older_than_hours, "Cleaned up finished tasks");
        Ok(removed)
    }

    /// Running tasks whose worker heartbeat has expired
    pub async fn find_abandoned_tasks(&self) -> Result<Vec<AbandonedTask>, SchedulerError> {
        let mut abandoned = Vec::new();

        for task_id in self.queue.running_ids().await? {
            let Some(task) = self.records.get(task_id).await? else {
                continue;
            };
            if task.status != TaskStatus::Running {
                continue;
            }
            let Some(worker_id) = task.worker_id.clone() else {
                warn!(task_id = %task_id, "Running task has no worker id");
                continue;
            };
            if self.store.exists(&worker_key(&worker_id)).await? {
                continue;
            }

            abandoned.push(AbandonedTask {
                task_id,
                task_type: task.task_type,
                worker_id,
                attempt: task.attempts,
                attempt_started_at: task.last_attempt_started_at,
            });
        }

        Ok(abandoned)
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("registry", &self.registry)
            .field("strict_handlers", &self.strict_handlers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use crate::task::{TaskContext, TaskError};
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryTaskStore>,
        scheduler: TaskScheduler,
        in_flight: Arc<InFlightTasks>,
        events: EventBus,
    }

    fn fixture(strict: bool) -> Fixture {
        let store = Arc::new(InMemoryTaskStore::new());
        let in_flight = Arc::new(InFlightTasks::new());
        let events = EventBus::new(64);
        let scheduler = TaskScheduler::new(
            store.clone(),
            Arc::new(HandlerRegistry::new()),
            in_flight.clone(),
            events.clone(),
            ScheduleDefaults {
                max_attempts: 3,
                timeout: Duration::from_secs(30),
            },
            strict,
        );
        Fixture {
            store,
            scheduler,
            in_flight,
            events,
        }
    }

    #[tokio::test]
    async fn test_schedule_writes_record_and_queue() {
        let fx = fixture(false);
        let mut sub = fx.events.subscribe();

        let task = fx
            .scheduler
            .schedule_task(
                "encode",
                serde_json::json!({"file": "a.mp4"}),
                ScheduleOptions::new().with_priority(TaskPriority::High),
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.timeout, Duration::from_secs(30));

        let stored = fx.scheduler.get_task(task.id).await.unwrap();
        assert_eq!(stored, task);

        let status = fx.scheduler.get_queue_status().await.unwrap();
        assert_eq!(status.depth[&TaskPriority::High], 1);
        assert_eq!(status.total_queued, 1);

        let event = sub.recv().await.unwrap();
        assert!(matches!(event.kind, TaskEventKind::TaskScheduled { task_id, .. } if task_id == task.id));
    }

    #[tokio::test]
    async fn test_delay_sets_scheduled_at() {
        let fx = fixture(false);
        let task = fx
            .scheduler
            .schedule_task(
                "t",
                serde_json::Value::Null,
                ScheduleOptions::new().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let scheduled = task.scheduled_at.unwrap();
        assert_eq!((scheduled - task.created_at).num_seconds(), 60);
    }

    #[tokio::test]
    async fn test_unknown_dependency_rejected() {
        let fx = fixture(false);
        let err = fx
            .scheduler
            .schedule_task(
                "t",
                serde_json::Value::Null,
                ScheduleOptions::new().with_dependency(TaskId::new()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert!(fx.scheduler.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strict_handlers() {
        let fx = fixture(true);
        let err = fx
            .scheduler
            .schedule_task("unknown", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::HandlerNotRegistered(ref t) if t == "unknown"));

        fx.scheduler.registry().register("known", |_ctx: TaskContext| async move {
            Ok::<_, TaskError>(serde_json::Value::Null)
        });
        fx.scheduler
            .schedule_task("known", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_failure_rolls_back_record() {
        let fx = fixture(false);
        fx.store.set_fail_sorted_adds(true);

        let err = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Store(StoreError::Unavailable(_))));

        fx.store.set_fail_sorted_adds(false);
        assert!(fx.scheduler.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_outage_surfaces() {
        let fx = fixture(false);
        fx.store.set_unavailable(true);

        let err = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Store(_)));
    }

    #[tokio::test]
    async fn test_cancel_pending_is_idempotent() {
        let fx = fixture(false);
        let task = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();

        assert!(fx.scheduler.cancel_task(task.id).await.unwrap());
        let cancelled = fx.scheduler.get_task(task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(fx.scheduler.get_queue_status().await.unwrap().total_queued, 0);

        assert!(!fx.scheduler.cancel_task(task.id).await.unwrap());
        assert_eq!(fx.scheduler.get_task(task.id).await.unwrap(), cancelled);
        assert_eq!(
            fx.scheduler.get_task_result(task.id).await.unwrap(),
            Some(TaskOutcome::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_cancel_running_fires_token() {
        let fx = fixture(false);
        let task = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();

        // Simulate a local worker holding the task
        TaskRecords::new(fx.store.clone())
            .update(task.id, |t| {
                t.status = TaskStatus::Running;
                t.attempts = 1;
                true
            })
            .await
            .unwrap();
        let token = fx.in_flight.register(task.id);

        assert!(!fx.scheduler.cancel_task(task.id).await.unwrap());
        assert!(token.is_cancelled());
        assert_eq!(
            fx.scheduler.get_task(task.id).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let fx = fixture(false);
        let id = TaskId::new();
        assert!(matches!(
            fx.scheduler.cancel_task(id).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(
            fx.scheduler.get_task(id).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(
            fx.scheduler.get_task_result(id).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_result_absent_until_terminal() {
        let fx = fixture(false);
        let task = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();
        assert_eq!(fx.scheduler.get_task_result(task.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_tasks_filters() {
        let fx = fixture(false);
        let tagged = fx
            .scheduler
            .schedule_task(
                "thumbnail",
                serde_json::Value::Null,
                ScheduleOptions::new().with_tag("batch-7"),
            )
            .await
            .unwrap();
        fx.scheduler
            .schedule_task("encode", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();

        let all = fx.scheduler.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let by_tag = fx
            .scheduler
            .list_tasks(&TaskFilter::default().with_tag("batch-7"))
            .await
            .unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].id, tagged.id);

        let by_type = fx
            .scheduler
            .list_tasks(
                &TaskFilter::default()
                    .with_task_type("encode")
                    .with_status(TaskStatus::Pending),
            )
            .await
            .unwrap();
        assert_eq!(by_type.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_old_terminal_tasks() {
        let fx = fixture(false);
        let records = TaskRecords::new(fx.store.clone());

        let old = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();
        let live = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();
        fx.scheduler.cancel_task(old.id).await.unwrap();
        records
            .update(old.id, |t| {
                t.completed_at = Some(Utc::now() - chrono::Duration::hours(48));
                true
            })
            .await
            .unwrap();

        assert_eq!(fx.scheduler.cleanup_completed_tasks(24).await.unwrap(), 1);
        assert!(matches!(
            fx.scheduler.get_task(old.id).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(fx.scheduler.get_task(live.id).await.is_ok());
        assert_eq!(fx.scheduler.cleanup_completed_tasks(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_abandoned_tasks() {
        let fx = fixture(false);
        let records = TaskRecords::new(fx.store.clone());
        let queue = TaskQueue::new(fx.store.clone());

        let task = fx
            .scheduler
            .schedule_task("t", serde_json::Value::Null, ScheduleOptions::new())
            .await
            .unwrap();
        queue.claim(&task).await.unwrap();
        records
            .update(task.id, |t| {
                t.status = TaskStatus::Running;
                t.attempts = 1;
                t.worker_id = Some("ghost-0".to_string());
                true
            })
            .await
            .unwrap();
        queue.mark_running(task.id, Utc::now()).await.unwrap();

        let abandoned = fx.scheduler.find_abandoned_tasks().await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].worker_id, "ghost-0");

        fx.store
            .set_with_ttl(&worker_key("ghost-0"), "{}".to_string(), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(fx.scheduler.find_abandoned_tasks().await.unwrap().is_empty());
    }
}
