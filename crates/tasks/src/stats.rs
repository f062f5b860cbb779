//! Periodic statistics snapshots
//!
//! The collector scans the store on an interval and caches the result, so
//! `get_stats()` never touches the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::events::{EventBus, TaskEventKind};
use crate::persistence::keys::WORKER_PREFIX;
use crate::persistence::{StoreError, TaskRecords, TaskStore};
use crate::task::{Task, TaskStatus};

/// Point-in-time engine statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,

    /// Workers with a fresh heartbeat, across all processes sharing the store
    pub active_workers: usize,

    /// Mean `completed_at - last_attempt_started_at` over the window
    pub avg_processing_ms: Option<f64>,

    /// Completions per minute over the window
    pub throughput_per_minute: f64,

    /// `failed / (completed + failed)`, 0 when nothing finished
    pub error_rate: f64,

    pub sampled_at: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Build a snapshot from task records
    pub fn from_tasks(
        tasks: &[Task],
        active_workers: usize,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = Self {
            total: tasks.len(),
            active_workers,
            sampled_at: now,
            ..Default::default()
        };

        let window_start = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut processing_total_ms = 0.0;
        let mut processing_samples = 0usize;
        let mut completed_in_window = 0usize;

        for task in tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Retrying => stats.retrying += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }

            if task.status != TaskStatus::Completed {
                continue;
            }
            let Some(completed_at) = task.completed_at else {
                continue;
            };
            if completed_at < window_start {
                continue;
            }

            completed_in_window += 1;
            if let Some(started) = task.last_attempt_started_at.or(task.started_at) {
                let elapsed = (completed_at - started).num_milliseconds().max(0);
                processing_total_ms += elapsed as f64;
                processing_samples += 1;
            }
        }

        if processing_samples > 0 {
            stats.avg_processing_ms = Some(processing_total_ms / processing_samples as f64);
        }

        let window_minutes = window.as_secs_f64() / 60.0;
        if window_minutes > 0.0 {
            stats.throughput_per_minute = completed_in_window as f64 / window_minutes;
        }

        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.error_rate = stats.failed as f64 / finished as f64;
        }

        stats
    }
}

/// Samples the store into [`StatsSnapshot`]s
pub struct StatisticsCollector {
    store: Arc<dyn TaskStore>,
    records: TaskRecords,
    events: EventBus,
    window: Duration,
    latest: RwLock<StatsSnapshot>,
}

impl StatisticsCollector {
    pub fn new(store: Arc<dyn TaskStore>, events: EventBus, window: Duration) -> Self {
        Self {
            records: TaskRecords::new(store.clone()),
            store,
            events,
            window,
            latest: RwLock::new(StatsSnapshot::default()),
        }
    }

    /// Last collected snapshot
    pub fn latest(&self) -> StatsSnapshot {
        self.latest.read().clone()
    }

    /// Sample now, cache the result and emit it
    #[instrument(skip(self))]
    pub async fn collect_now(&self) -> Result<StatsSnapshot, StoreError> {
        let tasks = self.records.scan().await?;
        let active_workers = self.store.scan_prefix(WORKER_PREFIX).await?.len();
        let snapshot = StatsSnapshot::from_tasks(&tasks, active_workers, self.window, Utc::now());

        *self.latest.write() = snapshot.clone();
        self.events.emit(TaskEventKind::StatsSnapshot {
            stats: snapshot.clone(),
        });

        debug!(
            total = snapshot.total,
            pending = snapshot.pending,
            running = snapshot.running,
            active_workers = snapshot.active_workers,
            "Collected statistics"
        );
        Ok(snapshot)
    }

    /// Collect every `interval` until `shutdown` fires
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.collect_now().await {
                            warn!(error = %e, "Statistics collection failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Statistics loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for StatisticsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsCollector")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use chrono::Duration as ChronoDuration;

    fn finished(status: TaskStatus, now: DateTime<Utc>, ago_secs: i64, took_ms: i64) -> Task {
        let mut task = Task::new("t", serde_json::Value::Null);
        task.status = status;
        let completed = now - ChronoDuration::seconds(ago_secs);
        task.completed_at = Some(completed);
        task.last_attempt_started_at = Some(completed - ChronoDuration::milliseconds(took_ms));
        task
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = StatsSnapshot::from_tasks(&[], 0, Duration::from_secs(60), Utc::now());
        assert_eq!(stats.total, 0);
        assert_eq!(stats.error_rate, 0.0);
        assert_eq!(stats.avg_processing_ms, None);
        assert_eq!(stats.throughput_per_minute, 0.0);
    }

    #[test]
    fn test_counts_and_rates() {
        let now = Utc::now();
        let mut pending = Task::new("t", serde_json::Value::Null);
        pending.status = TaskStatus::Pending;

        let tasks = vec![
            pending,
            finished(TaskStatus::Completed, now, 10, 100),
            finished(TaskStatus::Completed, now, 20, 300),
            finished(TaskStatus::Failed, now, 5, 50),
            // Outside the two minute window
            finished(TaskStatus::Completed, now, 600, 1000),
        ];

        let stats = StatsSnapshot::from_tasks(&tasks, 2, Duration::from_secs(120), now);

        assert_eq!(stats.total, 5);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active_workers, 2);
        assert_eq!(stats.avg_processing_ms, Some(200.0));
        assert!((stats.throughput_per_minute - 1.0).abs() < f64::EPSILON);
        assert!((stats.error_rate - 0.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_collect_now_caches_and_emits() {
        let store = Arc::new(InMemoryTaskStore::new());
        let records = TaskRecords::new(store.clone());
        records
            .put(&Task::new("t", serde_json::Value::Null))
            .await
            .unwrap();
        store
            .set_with_ttl("worker:w-0", "{}".to_string(), Duration::from_secs(10))
            .await
            .unwrap();

        let events = EventBus::new(8);
        let mut sub = events.subscribe();
        let collector = StatisticsCollector::new(store, events, Duration::from_secs(60));

        assert_eq!(collector.latest().total, 0);
        let snapshot = collector.collect_now().await.unwrap();
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.active_workers, 1);
        assert_eq!(collector.latest(), snapshot);

        let event = sub.recv().await.unwrap();
        assert!(matches!(event.kind, TaskEventKind::StatsSnapshot { .. }));
    }
}
