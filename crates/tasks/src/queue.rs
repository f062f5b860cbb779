//! Priority queue over the store's sorted sets
//!
//! Each priority class has its own sorted set `queue:{priority}`. A member's
//! score is
//!
//! ```text
//! priority_weight * PRIORITY_WEIGHT_SCALE - scheduled_at_millis
//! ```
//!
//! so within a class the earliest scheduled task has the highest score, and a
//! task is due once its score is at least `weight * SCALE - now_millis`.
//! Classes are walked critical first, so a due critical task always wins over
//! any lower class.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::persistence::keys::{queue_key, RUNNING_SET};
use crate::persistence::{Score, StoreError, TaskRecords, TaskStore};
use crate::task::{Task, TaskId, TaskPriority, TaskStatus};

/// Separates priority classes in the score space
///
/// Larger than any millisecond timestamp for the next ~30,000 years.
pub const PRIORITY_WEIGHT_SCALE: i64 = 1_000_000_000_000_000;

/// Queue score of a task in its class
pub fn priority_score(priority: TaskPriority, due_at: DateTime<Utc>) -> Score {
    priority.weight() * PRIORITY_WEIGHT_SCALE - due_at.timestamp_millis()
}

/// The per-priority queues plus the index of running tasks
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    records: TaskRecords,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        let records = TaskRecords::new(store.clone());
        Self { store, records }
    }

    /// Insert or re-score a task in its class
    pub async fn add_to_queue(
        &self,
        task_id: TaskId,
        priority: TaskPriority,
        due_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let score = priority_score(priority, due_at);
        self.store
            .sorted_add(&queue_key(priority), &task_id.to_string(), score)
            .await
    }

    /// Remove a task from whichever class holds it
    pub async fn remove_from_queue(&self, task_id: TaskId) -> Result<bool, StoreError> {
        let member = task_id.to_string();
        let mut removed = false;
        for priority in TaskPriority::ALL {
            removed |= self.store.sorted_remove(&queue_key(priority), &member).await?;
        }
        Ok(removed)
    }

    /// Highest-priority due task whose dependencies have all completed
    pub async fn peek_next(&self) -> Result<Option<Task>, StoreError> {
        self.peek_next_at(Utc::now()).await
    }

    /// [`peek_next`](Self::peek_next) against an explicit clock
    pub async fn peek_next_at(&self, now: DateTime<Utc>) -> Result<Option<Task>, StoreError> {
        let mut dependency_cache: HashMap<TaskId, bool> = HashMap::new();

        for priority in TaskPriority::ALL {
            let key = queue_key(priority);
            let mut due = self
                .store
                .sorted_range_by_score(&key, priority_score(priority, now), Score::MAX)
                .await?;

            // Earliest scheduled first; identical scores fall back to the id
            due.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

            for (member, _) in due {
                let Ok(task_id) = member.parse::<TaskId>() else {
                    debug!(queue = %key, member = %member, "Pruning malformed queue member");
                    self.store.sorted_remove(&key, &member).await?;
                    continue;
                };

                let task = match self.records.get(task_id).await? {
                    Some(task) if task.status.is_dispatchable() => task,
                    Some(task) => {
                        debug!(task_id = %task_id, status = %task.status, "Pruning stale queue member");
                        self.store.sorted_remove(&key, &member).await?;
                        continue;
                    }
                    None => {
                        debug!(task_id = %task_id, "Pruning queue member without record");
                        self.store.sorted_remove(&key, &member).await?;
                        continue;
                    }
                };

                if self.dependencies_met(&task, &mut dependency_cache).await? {
                    return Ok(Some(task));
                }
                trace!(task_id = %task_id, "Deferring task with unmet dependencies");
            }
        }

        Ok(None)
    }

    async fn dependencies_met(
        &self,
        task: &Task,
        cache: &mut HashMap<TaskId, bool>,
    ) -> Result<bool, StoreError> {
        for dep in &task.dependencies {
            let completed = match cache.get(dep) {
                Some(completed) => *completed,
                None => {
                    let completed = self
                        .records
                        .get(*dep)
                        .await?
                        .is_some_and(|t| t.status == TaskStatus::Completed);
                    cache.insert(*dep, completed);
                    completed
                }
            };
            if !completed {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Atomically take a peeked task out of its class
    ///
    /// Exactly one of several racing callers gets `true`.
    pub async fn claim(&self, task: &Task) -> Result<bool, StoreError> {
        self.store
            .sorted_remove(&queue_key(task.priority), &task.id.to_string())
            .await
    }

    /// Member count per class
    pub async fn depth_by_priority(&self) -> Result<BTreeMap<TaskPriority, usize>, StoreError> {
        let mut depth = BTreeMap::new();
        for priority in TaskPriority::ALL {
            depth.insert(priority, self.store.sorted_len(&queue_key(priority)).await?);
        }
        Ok(depth)
    }

    // =========================================================================
    // Running index
    // =========================================================================

    pub async fn mark_running(
        &self,
        task_id: TaskId,
        started_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .sorted_add(RUNNING_SET, &task_id.to_string(), started_at.timestamp_millis())
            .await
    }

    pub async fn clear_running(&self, task_id: TaskId) -> Result<bool, StoreError> {
        self.store.sorted_remove(RUNNING_SET, &task_id.to_string()).await
    }

    /// Ids in the running index, oldest attempt first
    pub async fn running_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let members = self
            .store
            .sorted_range_by_score(RUNNING_SET, Score::MIN, Score::MAX)
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|(member, _)| member.parse().ok())
            .collect())
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryTaskStore;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    struct Fixture {
        queue: TaskQueue,
        records: TaskRecords,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        Fixture {
            queue: TaskQueue::new(store.clone()),
            records: TaskRecords::new(store),
        }
    }

    async fn enqueue(fx: &Fixture, task: Task) -> Task {
        fx.records.put(&task).await.unwrap();
        fx.queue
            .add_to_queue(task.id, task.priority, task.due_at())
            .await
            .unwrap();
        task
    }

    #[tokio::test]
    async fn test_priority_classes_win_over_age() {
        let fx = fixture();
        let now = Utc::now();

        let old_low = enqueue(
            &fx,
            Task::new("t", serde_json::Value::Null)
                .with_priority(TaskPriority::Low)
                .with_scheduled_at(now - ChronoDuration::hours(1)),
        )
        .await;
        let critical = enqueue(
            &fx,
            Task::new("t", serde_json::Value::Null)
                .with_priority(TaskPriority::Critical)
                .with_scheduled_at(now),
        )
        .await;

        let next = fx.queue.peek_next_at(now).await.unwrap().unwrap();
        assert_eq!(next.id, critical.id);

        assert!(fx.queue.claim(&next).await.unwrap());
        let next = fx.queue.peek_next_at(now).await.unwrap().unwrap();
        assert_eq!(next.id, old_low.id);
    }

    #[tokio::test]
    async fn test_earliest_scheduled_first_within_class() {
        let fx = fixture();
        let now = Utc::now();

        let later = enqueue(
            &fx,
            Task::new("t", serde_json::Value::Null)
                .with_priority(TaskPriority::High)
                .with_scheduled_at(now - ChronoDuration::seconds(1)),
        )
        .await;
        let earlier = enqueue(
            &fx,
            Task::new("t", serde_json::Value::Null)
                .with_priority(TaskPriority::High)
                .with_scheduled_at(now - ChronoDuration::seconds(10)),
        )
        .await;

        let next = fx.queue.peek_next_at(now).await.unwrap().unwrap();
        assert_eq!(next.id, earlier.id);
        fx.queue.claim(&next).await.unwrap();
        assert_eq!(fx.queue.peek_next_at(now).await.unwrap().unwrap().id, later.id);
    }

    #[tokio::test]
    async fn test_identical_scores_break_ties_by_id() {
        let fx = fixture();
        let at = Utc::now();

        let first = enqueue(&fx, Task::new("t", serde_json::Value::Null).with_scheduled_at(at)).await;
        let second = enqueue(&fx, Task::new("t", serde_json::Value::Null).with_scheduled_at(at)).await;
        assert!(first.id.to_string() < second.id.to_string());

        let next = fx.queue.peek_next_at(at).await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }

    #[tokio::test]
    async fn test_future_tasks_are_not_due() {
        let fx = fixture();
        let now = Utc::now();

        let delayed = enqueue(
            &fx,
            Task::new("t", serde_json::Value::Null)
                .with_priority(TaskPriority::Critical)
                .with_scheduled_at(now + ChronoDuration::seconds(30)),
        )
        .await;

        assert!(fx.queue.peek_next_at(now).await.unwrap().is_none());

        let due = fx
            .queue
            .peek_next_at(now + ChronoDuration::seconds(31))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(due.id, delayed.id);
    }

    #[tokio::test]
    async fn test_unmet_dependencies_are_skipped() {
        let fx = fixture();
        let now = Utc::now();

        let parent = enqueue(
            &fx,
            Task::new("t", serde_json::Value::Null)
                .with_priority(TaskPriority::Low)
                .with_scheduled_at(now),
        )
        .await;
        let mut child = Task::new("t", serde_json::Value::Null)
            .with_priority(TaskPriority::Critical)
            .with_scheduled_at(now);
        child.dependencies = vec![parent.id];
        let child = enqueue(&fx, child).await;

        // The critical child is skipped, the low parent is selected
        let next = fx.queue.peek_next_at(now).await.unwrap().unwrap();
        assert_eq!(next.id, parent.id);
        fx.queue.claim(&next).await.unwrap();
        assert!(fx.queue.peek_next_at(now).await.unwrap().is_none());

        // Failed parents keep children waiting
        fx.records
            .update(parent.id, |t| {
                t.status = TaskStatus::Failed;
                true
            })
            .await
            .unwrap();
        assert!(fx.queue.peek_next_at(now).await.unwrap().is_none());

        fx.records
            .update(parent.id, |t| {
                t.status = TaskStatus::Completed;
                true
            })
            .await
            .unwrap();
        assert_eq!(fx.queue.peek_next_at(now).await.unwrap().unwrap().id, child.id);
    }

    #[tokio::test]
    async fn test_stale_members_are_pruned() {
        let fx = fixture();
        let now = Utc::now();

        let orphan = TaskId::new();
        fx.queue
            .add_to_queue(orphan, TaskPriority::High, now)
            .await
            .unwrap();

        let mut cancelled = Task::new("t", serde_json::Value::Null)
            .with_priority(TaskPriority::High)
            .with_scheduled_at(now);
        cancelled.status = TaskStatus::Cancelled;
        let cancelled = enqueue(&fx, cancelled).await;

        assert!(fx.queue.peek_next_at(now).await.unwrap().is_none());
        let depth = fx.queue.depth_by_priority().await.unwrap();
        assert_eq!(depth[&TaskPriority::High], 0);
        assert!(!fx.queue.remove_from_queue(cancelled.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let fx = fixture();
        let task = enqueue(&fx, Task::new("t", serde_json::Value::Null)).await;

        assert!(fx.queue.claim(&task).await.unwrap());
        assert!(!fx.queue.claim(&task).await.unwrap());
    }

    #[tokio::test]
    async fn test_running_index() {
        let fx = fixture();
        let a = TaskId::new();
        let b = TaskId::new();
        let now = Utc::now();

        fx.queue.mark_running(b, now).await.unwrap();
        fx.queue
            .mark_running(a, now - ChronoDuration::seconds(5))
            .await
            .unwrap();
        assert_eq!(fx.queue.running_ids().await.unwrap(), vec![a, b]);

        assert!(fx.queue.clear_running(a).await.unwrap());
        assert_eq!(fx.queue.running_ids().await.unwrap(), vec![b]);
    }

    fn priority_strategy() -> impl Strategy<Value = TaskPriority> {
        prop::sample::select(TaskPriority::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_higher_class_always_scores_higher(
            high in priority_strategy(),
            low in priority_strategy(),
            a_millis in 0i64..4_102_444_800_000,
            b_millis in 0i64..4_102_444_800_000,
        ) {
            prop_assume!(high.weight() > low.weight());
            let a = DateTime::<Utc>::from_timestamp_millis(a_millis).unwrap();
            let b = DateTime::<Utc>::from_timestamp_millis(b_millis).unwrap();
            prop_assert!(priority_score(high, a) > priority_score(low, b));
        }

        #[test]
        fn prop_earlier_schedule_scores_higher_within_class(
            priority in priority_strategy(),
            earlier in 0i64..4_102_444_800_000,
            gap in 1i64..1_000_000_000,
        ) {
            let a = DateTime::<Utc>::from_timestamp_millis(earlier).unwrap();
            let b = DateTime::<Utc>::from_timestamp_millis(earlier + gap).unwrap();
            prop_assert!(priority_score(priority, a) > priority_score(priority, b));
        }
    }
}
