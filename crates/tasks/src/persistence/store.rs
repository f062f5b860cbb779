//! TaskStore trait definition

use std::time::Duration;

use async_trait::async_trait;

/// Score of a sorted-set member
pub type Score = i64;

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable or refused the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compare-and-set kept losing against concurrent writers
    #[error("concurrency conflict on key {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Shared key-value store the engine persists into
///
/// The contract mirrors a Redis-like server: plain keys, expiring keys and
/// score-ordered sets. Multiple engine processes may share one store; the
/// only coordination primitives they rely on are [`sorted_remove`] (exactly
/// one caller observes `true` for a given member) and [`compare_and_set`].
///
/// [`sorted_remove`]: TaskStore::sorted_remove
/// [`compare_and_set`]: TaskStore::compare_and_set
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Plain keys
    // =========================================================================

    /// Read a key. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a key, clearing any expiry
    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Replace the value only if it still equals `expected`
    ///
    /// Returns false when the key is absent or holds something else.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
    ) -> Result<bool, StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List live keys starting with `prefix`
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    // =========================================================================
    // Expiring keys
    // =========================================================================

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration)
        -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    // =========================================================================
    // Sorted sets
    // =========================================================================

    /// Add a member, overwriting its score if present
    async fn sorted_add(&self, set: &str, member: &str, score: Score) -> Result<(), StoreError>;

    /// Remove a member. Returns true only for the caller that removed it.
    async fn sorted_remove(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    /// Members with `min <= score <= max`, ascending by score then member
    async fn sorted_range_by_score(
        &self,
        set: &str,
        min: Score,
        max: Score,
    ) -> Result<Vec<(String, Score)>, StoreError>;

    async fn sorted_len(&self, set: &str) -> Result<usize, StoreError>;
}
