//! Typed access to task records

use std::sync::Arc;

use tracing::warn;

use super::keys::{task_id_from_key, task_key, TASK_PREFIX};
use super::store::{StoreError, TaskStore};
use crate::task::{Task, TaskId};

/// Compare-and-set attempts before an update gives up with `Conflict`
const MAX_CAS_RETRIES: usize = 16;

/// Result of a conditional record update
#[derive(Debug, Clone)]
pub enum RecordUpdate {
    /// The mutation was written
    Updated(Task),
    /// The mutation declined to change the record
    Unchanged(Task),
    /// No record with that id
    NotFound,
}

/// Task records stored as JSON under `task:{id}`
#[derive(Clone)]
pub struct TaskRecords {
    store: Arc<dyn TaskStore>,
}

impl TaskRecords {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        match self.store.get(&task_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn put(&self, task: &Task) -> Result<(), StoreError> {
        let raw = serde_json::to_string(task)?;
        self.store.set(&task_key(task.id), raw).await
    }

    pub async fn delete(&self, id: TaskId) -> Result<bool, StoreError> {
        self.store.delete(&task_key(id)).await
    }

    /// Apply `mutate` with compare-and-set, retrying on concurrent writes
    ///
    /// `mutate` returns false to leave the record as it is. It may run more
    /// than once, always against the latest stored version.
    pub async fn update<F>(&self, id: TaskId, mut mutate: F) -> Result<RecordUpdate, StoreError>
    where
        F: FnMut(&mut Task) -> bool,
    {
        let key = task_key(id);

        for _ in 0..MAX_CAS_RETRIES {
            let Some(raw) = self.store.get(&key).await? else {
                return Ok(RecordUpdate::NotFound);
            };

            let mut task: Task = serde_json::from_str(&raw)?;
            if !mutate(&mut task) {
                return Ok(RecordUpdate::Unchanged(task));
            }

            let next = serde_json::to_string(&task)?;
            if self.store.compare_and_set(&key, &raw, next).await? {
                return Ok(RecordUpdate::Updated(task));
            }
        }

        Err(StoreError::Conflict(key))
    }

    /// Load every task record
    ///
    /// Records that fail to decode are skipped with a warning.
    pub async fn scan(&self) -> Result<Vec<Task>, StoreError> {
        let keys = self.store.scan_prefix(TASK_PREFIX).await?;
        let mut tasks = Vec::with_capacity(keys.len());

        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<Task>(&raw) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(key = %key, task_id = ?task_id_from_key(&key), error = %e, "Skipping undecodable task record");
                }
            }
        }

        Ok(tasks)
    }
}

impl std::fmt::Debug for TaskRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRecords").finish_non_exhaustive()
    }
}
