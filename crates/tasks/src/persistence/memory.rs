//! In-memory implementation of TaskStore

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::store::{Score, StoreError, TaskStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct SortedSet {
    ordered: BTreeSet<(Score, String)>,
    scores: HashMap<String, Score>,
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Entry>,
    sorted: HashMap<String, SortedSet>,
}

/// In-memory implementation of [`TaskStore`]
///
/// Every operation runs under one lock, which gives the same atomicity a
/// single Redis server provides. Used by tests, benches and the demo binary.
///
/// Faults can be injected to exercise the engine's store-error paths.
///
/// # Example
///
/// ```
/// use castplan_tasks::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.key_count(), 0);
/// ```
pub struct InMemoryTaskStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    fail_sorted_adds: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            unavailable: AtomicBool::new(false),
            fail_sorted_adds: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `Unavailable` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `sorted_add` fail with `Unavailable` until reset
    pub fn set_fail_sorted_adds(&self, fail: bool) {
        self.fail_sorted_adds.store(fail, Ordering::SeqCst);
    }

    /// Number of live plain and expiring keys
    pub fn key_count(&self) -> usize {
        let now = Instant::now();
        self.state.lock().keys.values().filter(|e| e.is_live(now)).count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.keys.clear();
        state.sorted.clear();
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryTaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryTaskStore")
            .field("keys", &state.keys.len())
            .field("sorted_sets", &state.sorted.len())
            .finish()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let state = self.state.lock();
        Ok(state
            .keys
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().keys.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        match state.keys.get_mut(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entry.value = value;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .keys
            .remove(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        state.keys.retain(|_, e| e.is_live(now));
        let mut keys: Vec<String> = state
            .keys
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().keys.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        Ok(self
            .state
            .lock()
            .keys
            .get(key)
            .is_some_and(|e| e.is_live(now)))
    }

    async fn sorted_add(&self, set: &str, member: &str, score: Score) -> Result<(), StoreError> {
        self.check_available()?;
        if self.fail_sorted_adds.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("sorted_add rejected for {set}")));
        }

        let mut state = self.state.lock();
        let sorted = state.sorted.entry(set.to_string()).or_default();
        if let Some(previous) = sorted.scores.insert(member.to_string(), score) {
            sorted.ordered.remove(&(previous, member.to_string()));
        }
        sorted.ordered.insert((score, member.to_string()));
        Ok(())
    }

    async fn sorted_remove(&self, set: &str, member: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock();
        let Some(sorted) = state.sorted.get_mut(set) else {
            return Ok(false);
        };
        match sorted.scores.remove(member) {
            Some(score) => {
                sorted.ordered.remove(&(score, member.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sorted_range_by_score(
        &self,
        set: &str,
        min: Score,
        max: Score,
    ) -> Result<Vec<(String, Score)>, StoreError> {
        self.check_available()?;
        if min > max {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        let Some(sorted) = state.sorted.get(set) else {
            return Ok(Vec::new());
        };
        Ok(sorted
            .ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .map(|(score, member)| (member.clone(), *score))
            .collect())
    }

    async fn sorted_len(&self, set: &str) -> Result<usize, StoreError> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .sorted
            .get(set)
            .map_or(0, |s| s.scores.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_set_delete() {
        let store = InMemoryTaskStore::new();

        assert_eq!(store.get("task:a").await.unwrap(), None);
        store.set("task:a", "1".to_string()).await.unwrap();
        assert_eq!(store.get("task:a").await.unwrap(), Some("1".to_string()));

        assert!(store.delete("task:a").await.unwrap());
        assert!(!store.delete("task:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = InMemoryTaskStore::new();
        store.set("k", "v1".to_string()).await.unwrap();

        assert!(!store.compare_and_set("k", "v0", "v2".to_string()).await.unwrap());
        assert!(store.compare_and_set("k", "v1", "v2".to_string()).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v2".to_string()));

        assert!(!store
            .compare_and_set("missing", "v1", "v2".to_string())
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = InMemoryTaskStore::new();
        store
            .set_with_ttl("worker:w-0", "{}".to_string(), Duration::from_millis(100))
            .await
            .unwrap();

        assert!(store.exists("worker:w-0").await.unwrap());
        assert_eq!(store.scan_prefix("worker:").await.unwrap().len(), 1);

        tokio::time::advance(Duration::from_millis(150)).await;

        assert!(!store.exists("worker:w-0").await.unwrap());
        assert!(store.scan_prefix("worker:").await.unwrap().is_empty());
        assert_eq!(store.get("worker:w-0").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix_is_sorted_and_filtered() {
        let store = InMemoryTaskStore::new();
        store.set("task:b", "x".to_string()).await.unwrap();
        store.set("task:a", "x".to_string()).await.unwrap();
        store.set("worker:a", "x".to_string()).await.unwrap();

        let keys = store.scan_prefix("task:").await.unwrap();
        assert_eq!(keys, vec!["task:a".to_string(), "task:b".to_string()]);
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_overwrite() {
        let store = InMemoryTaskStore::new();
        store.sorted_add("q", "b", 10).await.unwrap();
        store.sorted_add("q", "a", 10).await.unwrap();
        store.sorted_add("q", "c", 5).await.unwrap();

        let all = store.sorted_range_by_score("q", i64::MIN, i64::MAX).await.unwrap();
        let members: Vec<_> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["c", "a", "b"]);

        // Re-adding overwrites the score
        store.sorted_add("q", "c", 20).await.unwrap();
        assert_eq!(store.sorted_len("q").await.unwrap(), 3);
        let top = store.sorted_range_by_score("q", 15, i64::MAX).await.unwrap();
        assert_eq!(top, vec![("c".to_string(), 20)]);
    }

    #[tokio::test]
    async fn test_sorted_remove_only_once() {
        let store = InMemoryTaskStore::new();
        store.sorted_add("q", "a", 1).await.unwrap();

        assert!(store.sorted_remove("q", "a").await.unwrap());
        assert!(!store.sorted_remove("q", "a").await.unwrap());
        assert!(!store.sorted_remove("other", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = InMemoryTaskStore::new();

        store.set_fail_sorted_adds(true);
        store.set("k", "v".to_string()).await.unwrap();
        assert!(matches!(
            store.sorted_add("q", "a", 1).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_unavailable(true);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));

        store.set_unavailable(false);
        store.set_fail_sorted_adds(false);
        store.sorted_add("q", "a", 1).await.unwrap();
    }
}
