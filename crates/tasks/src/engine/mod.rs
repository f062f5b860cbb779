//! Task engine
//!
//! [`TaskEngine`] owns one scheduler, one worker pool, one statistics
//! collector and one event bus over a shared [`TaskStore`]. Nothing is
//! global: two engines in one process are fully independent.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::events::{EventBus, EventSubscription};
use crate::persistence::{InMemoryTaskStore, StoreError, TaskStore};
use crate::scheduler::{
    AbandonedTask, HandlerRegistry, QueueStatus, ScheduleDefaults, SchedulerError, TaskScheduler,
};
use crate::stats::{StatisticsCollector, StatsSnapshot};
use crate::task::{
    InFlightTasks, ScheduleOptions, Task, TaskFilter, TaskHandler, TaskId, TaskOutcome,
};
use crate::worker::{AbandonedTaskMonitor, WorkerPool, WorkerPoolConfig, WorkerPoolError};

/// Store-backed task engine
///
/// # Example
///
/// ```
/// use castplan_tasks::{EngineConfig, ScheduleOptions, TaskContext, TaskEngine, TaskPriority};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = TaskEngine::in_memory(EngineConfig::default())?;
/// engine.register_handler("echo", |ctx: TaskContext| async move {
///     Ok(ctx.payload().clone())
/// });
///
/// let task = engine
///     .schedule_task(
///         "echo",
///         json!({"hello": "world"}),
///         ScheduleOptions::new().with_priority(TaskPriority::High),
///     )
///     .await?;
/// assert_eq!(engine.get_task(task.id).await?.priority, TaskPriority::High);
/// # Ok(())
/// # }
/// ```
pub struct TaskEngine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    events: EventBus,
    scheduler: Arc<TaskScheduler>,
    pool: WorkerPool,
    stats: Arc<StatisticsCollector>,
    background: Mutex<Background>,
}

#[derive(Default)]
struct Background {
    shutdown: Option<CancellationToken>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskEngine {
    /// Build an engine over `store`
    pub fn new(store: Arc<dyn TaskStore>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let registry = Arc::new(HandlerRegistry::new());
        let in_flight = Arc::new(InFlightTasks::new());

        let scheduler = Arc::new(TaskScheduler::new(
            store.clone(),
            registry.clone(),
            in_flight.clone(),
            events.clone(),
            ScheduleDefaults {
                max_attempts: config.default_max_attempts,
                timeout: config.task_timeout,
            },
            config.strict_handlers,
        ));
        let pool = WorkerPool::new(
            store.clone(),
            registry,
            in_flight,
            events.clone(),
            WorkerPoolConfig::from(&config),
        );
        let stats = Arc::new(StatisticsCollector::new(
            store.clone(),
            events.clone(),
            config.stats_window,
        ));

        Ok(Self {
            config,
            store,
            events,
            scheduler,
            pool,
            stats,
            background: Mutex::new(Background::default()),
        })
    }

    /// Engine over a fresh [`InMemoryTaskStore`]
    pub fn in_memory(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::new(Arc::new(InMemoryTaskStore::new()), config)
    }

    /// Register the handler for `task_type`, replacing any previous one
    pub fn register_handler<H: TaskHandler>(&self, task_type: impl Into<String>, handler: H) -> bool {
        self.scheduler.registry().register(task_type, handler)
    }

    pub async fn schedule_task(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: ScheduleOptions,
    ) -> Result<Task, SchedulerError> {
        self.scheduler.schedule_task(task_type, payload, options).await
    }

    /// Cancel a task. Returns false if it was running or already finished.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<bool, SchedulerError> {
        self.scheduler.cancel_task(task_id).await
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, SchedulerError> {
        self.scheduler.get_task(task_id).await
    }

    /// Terminal outcome, or `None` while the task is still live
    pub async fn get_task_result(&self, task_id: TaskId) -> Result<Option<TaskOutcome>, SchedulerError> {
        self.scheduler.get_task_result(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, SchedulerError> {
        self.scheduler.list_tasks(filter).await
    }

    pub async fn get_queue_status(&self) -> Result<QueueStatus, SchedulerError> {
        self.scheduler.get_queue_status().await
    }

    /// Delete terminal tasks finished more than `older_than_hours` ago
    pub async fn cleanup_completed_tasks(&self, older_than_hours: u64) -> Result<usize, SchedulerError> {
        self.scheduler.cleanup_completed_tasks(older_than_hours).await
    }

    pub async fn find_abandoned_tasks(&self) -> Result<Vec<AbandonedTask>, SchedulerError> {
        self.scheduler.find_abandoned_tasks().await
    }

    /// Last collected snapshot; does not touch the store
    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.latest()
    }

    /// Sample statistics immediately
    pub async fn collect_stats_now(&self) -> Result<StatsSnapshot, StoreError> {
        self.stats.collect_now().await
    }

    /// Subscribe to lifecycle events; drop the subscription to unsubscribe
    pub fn subscribe(&self) -> EventSubscription {
        self.events.subscribe()
    }

    /// Start the worker pool and the background samplers
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        self.pool.start().await?;

        let shutdown = CancellationToken::new();
        let monitor = AbandonedTaskMonitor::new(self.scheduler.clone(), self.events.clone());
        let handles = vec![
            self.stats
                .clone()
                .spawn(self.config.stats_interval, shutdown.child_token()),
            monitor.spawn(self.config.abandoned_check_interval, shutdown.child_token()),
        ];
        *self.background.lock() = Background {
            shutdown: Some(shutdown),
            handles,
        };

        info!(
            concurrency = self.config.concurrency,
            max_in_flight = self.config.effective_max_in_flight(),
            handlers = ?self.scheduler.registry().task_types(),
            "Task engine started"
        );
        Ok(())
    }

    /// Stop the pool, waiting for in-flight attempts, then the samplers
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), WorkerPoolError> {
        let result = self.pool.stop().await;

        let Background { shutdown, handles } = std::mem::take(&mut *self.background.lock());
        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Task engine stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("pool", &self.pool)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskContext, TaskStatus};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = TaskEngine::in_memory(EngineConfig::default().with_concurrency(0));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_independent_engines() {
        let a = TaskEngine::in_memory(EngineConfig::default()).unwrap();
        let b = TaskEngine::in_memory(EngineConfig::default()).unwrap();
        a.register_handler("echo", |ctx: TaskContext| async move { Ok(ctx.payload().clone()) });

        let task = a
            .schedule_task("echo", json!(1), ScheduleOptions::new())
            .await
            .unwrap();
        assert!(matches!(
            b.get_task(task.id).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(a.scheduler().registry().contains("echo"));
        assert!(!b.scheduler().registry().contains("echo"));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let engine = TaskEngine::in_memory(
            EngineConfig::default()
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(10))
                .with_stats(Duration::from_millis(20), Duration::from_secs(60)),
        )
        .unwrap();
        engine.register_handler("echo", |ctx: TaskContext| async move { Ok(ctx.payload().clone()) });

        let task = engine
            .schedule_task("echo", json!("hi"), ScheduleOptions::new())
            .await
            .unwrap();

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(matches!(
            engine.start().await,
            Err(WorkerPoolError::AlreadyRunning)
        ));

        let mut outcome = None;
        for _ in 0..100 {
            outcome = engine.get_task_result(task.id).await.unwrap();
            if outcome.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(outcome, Some(TaskOutcome::Completed(json!("hi"))));

        let stats = engine.collect_stats_now().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(engine.get_stats().completed, 1);

        engine.stop().await.unwrap();
        assert!(!engine.is_running());
        assert_eq!(
            engine.get_task(task.id).await.unwrap().status,
            TaskStatus::Completed
        );
    }
}
