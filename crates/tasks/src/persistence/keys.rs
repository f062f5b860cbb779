//! Key layout inside the store

use crate::task::{TaskId, TaskPriority};

pub const TASK_PREFIX: &str = "task:";
pub const QUEUE_PREFIX: &str = "queue:";
pub const WORKER_PREFIX: &str = "worker:";

/// Sorted set of running task ids, scored by attempt start millis
pub const RUNNING_SET: &str = "running";

pub fn task_key(id: TaskId) -> String {
    format!("{TASK_PREFIX}{id}")
}

pub fn queue_key(priority: TaskPriority) -> String {
    format!("{QUEUE_PREFIX}{priority}")
}

pub fn worker_key(worker_id: &str) -> String {
    format!("{WORKER_PREFIX}{worker_id}")
}

/// Parse the id out of a `task:{id}` key
pub fn task_id_from_key(key: &str) -> Option<TaskId> {
    key.strip_prefix(TASK_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let id = TaskId::new();
        assert_eq!(task_key(id), format!("task:{id}"));
        assert_eq!(queue_key(TaskPriority::Critical), "queue:critical");
        assert_eq!(worker_key("pool-a-0"), "worker:pool-a-0");
        assert_eq!(task_id_from_key(&task_key(id)), Some(id));
        assert_eq!(task_id_from_key("worker:x"), None);
    }
}
