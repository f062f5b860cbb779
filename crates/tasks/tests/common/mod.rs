//! Shared helpers for engine integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use castplan_tasks::{
    EngineConfig, InMemoryTaskStore, Task, TaskEngine, TaskEvent, TaskEventKind, TaskId,
};

/// Config with short intervals so tests settle in milliseconds
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_concurrency(2)
        .with_poll_interval(Duration::from_millis(5))
        .with_max_poll_interval(Duration::from_millis(50))
        .with_max_idle_time(Duration::from_secs(5))
        .with_task_timeout(Duration::from_secs(5))
        .with_retry_delays(vec![Duration::from_millis(20)])
        .with_heartbeat(Duration::from_millis(50), Duration::from_millis(500))
        .with_stats(Duration::from_secs(60), Duration::from_secs(60))
        .with_abandoned_check_interval(Duration::from_secs(60))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_worker_id_prefix("itest")
}

/// Engine over an in-memory store the test keeps a handle to
pub fn engine_with_store(config: EngineConfig) -> (TaskEngine, Arc<InMemoryTaskStore>) {
    let store = Arc::new(InMemoryTaskStore::new());
    let engine = TaskEngine::new(store.clone(), config).expect("valid config");
    (engine, store)
}

/// Poll until the task reaches a terminal status
pub async fn wait_for_terminal(engine: &TaskEngine, task_id: TaskId, timeout: Duration) -> Task {
    wait_for(engine, task_id, timeout, |t| t.is_terminal()).await
}

/// Poll until `done` holds for the task record
pub async fn wait_for<F>(engine: &TaskEngine, task_id: TaskId, timeout: Duration, done: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = engine.get_task(task_id).await.expect("task exists");
        if done(&task) {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "task {task_id} did not settle within {timeout:?}, last status {}",
                task.status
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Buffered events for one task, in order
pub fn drain_events_for(
    subscription: &mut castplan_tasks::EventSubscription,
    task_id: TaskId,
) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        if event.kind.task_id() == Some(task_id) {
            events.push(event);
        }
    }
    events
}

pub fn event_names(events: &[TaskEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind.name()).collect()
}

pub fn is_stats(event: &TaskEvent) -> bool {
    matches!(event.kind, TaskEventKind::StatsSnapshot { .. })
}
