//! Worker heartbeat records
//!
//! Each poll loop keeps `worker:{id}` alive with a TTL. A record that
//! expires marks the worker dead; tasks it was running are then reported
//! as abandoned.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::persistence::keys::worker_key;
use crate::persistence::{StoreError, TaskStore};

/// Value stored under `worker:{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub pool_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Refreshes one loop's heartbeat record
#[derive(Clone)]
pub struct Heartbeat {
    store: Arc<dyn TaskStore>,
    record: WorkerRecord,
    interval: Duration,
    ttl: Duration,
}

impl Heartbeat {
    pub fn new(
        store: Arc<dyn TaskStore>,
        worker_id: impl Into<String>,
        pool_id: impl Into<String>,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            store,
            record: WorkerRecord {
                worker_id: worker_id.into(),
                pool_id: pool_id.into(),
                started_at: now,
                last_heartbeat_at: now,
            },
            interval,
            ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.record.worker_id
    }

    /// Write the record with a fresh TTL
    pub async fn beat(&self) -> Result<(), StoreError> {
        let record = WorkerRecord {
            last_heartbeat_at: Utc::now(),
            ..self.record.clone()
        };
        let value = serde_json::to_string(&record)?;
        self.store
            .set_with_ttl(&worker_key(&record.worker_id), value, self.ttl)
            .await
    }

    /// Remove the record
    pub async fn clear(&self) -> Result<(), StoreError> {
        self.store.delete(&worker_key(&self.record.worker_id)).await?;
        Ok(())
    }

    /// Beat every `interval` until `stop` fires
    pub fn spawn(self, stop: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.beat().await {
                            warn!(worker_id = %self.record.worker_id, error = %e, "Heartbeat failed");
                        }
                    }
                    _ = stop.cancelled() => {
                        debug!(worker_id = %self.record.worker_id, "Heartbeat stopped");
                        break;
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("worker_id", &self.record.worker_id)
            .field("interval", &self.interval)
            .field("ttl", &self.ttl)
            .finish()
    }
}
