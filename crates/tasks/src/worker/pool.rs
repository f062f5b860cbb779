//! Worker pool
//!
//! Runs `concurrency` poll loops that share one limiter, one handler
//! registry and one in-flight table. Stopping cancels the loops, lets
//! in-flight attempts finish and waits up to `shutdown_timeout`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::executor::WorkerLoop;
use super::heartbeat::Heartbeat;
use super::limiter::ConcurrencyLimiter;
use super::poller::PollerConfig;
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::persistence::{StoreError, TaskRecords, TaskStore};
use crate::queue::TaskQueue;
use crate::reliability::RetryLadder;
use crate::scheduler::HandlerRegistry;
use crate::serde_util::duration_millis;
use crate::task::InFlightTasks;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Worker ids are `{pool_id}-{n}`
    pub pool_id: String,

    /// Number of poll loops
    pub concurrency: usize,

    /// Limiter capacity shared by all loops
    pub max_in_flight: usize,

    pub poller: PollerConfig,

    pub retry: RetryLadder,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    #[serde(with = "duration_millis")]
    pub heartbeat_ttl: Duration,

    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl From<&EngineConfig> for WorkerPoolConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            pool_id: config.worker_id_prefix.clone(),
            concurrency: config.concurrency.max(1),
            max_in_flight: config.effective_max_in_flight(),
            poller: PollerConfig::default()
                .with_poll_interval(config.poll_interval)
                .with_max_poll_interval(config.max_poll_interval)
                .with_max_idle_time(config.max_idle_time)
                .with_idle_backoff_multiplier(config.idle_backoff_multiplier),
            retry: config.retry_delays.clone(),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_ttl: config.heartbeat_ttl,
            shutdown_timeout: config.effective_shutdown_timeout(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl WorkerPoolConfig {
    pub fn with_pool_id(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = pool_id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Id of the `n`th poll loop
    pub fn worker_id(&self, n: usize) -> String {
        format!("{}-{}", self.pool_id, n)
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Writing initial heartbeats
    Starting,
    /// Loops are polling
    Running,
    /// Loops are finishing in-flight attempts
    Draining,
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    /// In-flight attempts outlived the shutdown timeout
    #[error("graceful shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// State shared by every poll loop of a pool
pub(crate) struct PoolContext {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) records: TaskRecords,
    pub(crate) queue: TaskQueue,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) in_flight: Arc<InFlightTasks>,
    pub(crate) limiter: Arc<ConcurrencyLimiter>,
    pub(crate) events: EventBus,
    pub(crate) config: WorkerPoolConfig,
}

#[derive(Default)]
struct RunState {
    shutdown: Option<CancellationToken>,
    heartbeats: Option<CancellationToken>,
    loops: Vec<JoinHandle<()>>,
}

/// Pool of poll loops
pub struct WorkerPool {
    ctx: Arc<PoolContext>,
    status: RwLock<WorkerPoolStatus>,
    run: Mutex<RunState>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        in_flight: Arc<InFlightTasks>,
        events: EventBus,
        config: WorkerPoolConfig,
    ) -> Self {
        let limiter = Arc::new(ConcurrencyLimiter::new(config.max_in_flight));
        Self {
            ctx: Arc::new(PoolContext {
                records: TaskRecords::new(store.clone()),
                queue: TaskQueue::new(store.clone()),
                store,
                registry,
                in_flight,
                limiter,
                events,
                config,
            }),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            run: Mutex::new(RunState::default()),
        }
    }

    /// Write initial heartbeats and spawn the poll loops
    ///
    /// A store failure here is returned and the pool stays stopped.
    #[instrument(skip(self), fields(pool_id = %self.ctx.config.pool_id))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        let config = &self.ctx.config;
        let mut heartbeats = Vec::with_capacity(config.concurrency);
        for n in 0..config.concurrency {
            let heartbeat = Heartbeat::new(
                self.ctx.store.clone(),
                config.worker_id(n),
                config.pool_id.clone(),
                config.heartbeat_interval,
                config.heartbeat_ttl,
            );
            if let Err(e) = heartbeat.beat().await {
                error!(error = %e, "Failed to register worker heartbeat");
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(e.into());
            }
            heartbeats.push(heartbeat);
        }

        let shutdown = CancellationToken::new();
        let heartbeat_root = CancellationToken::new();
        let loops = heartbeats
            .into_iter()
            .map(|heartbeat| {
                let worker = WorkerLoop::new(
                    Arc::clone(&self.ctx),
                    heartbeat,
                    heartbeat_root.child_token(),
                    shutdown.child_token(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        *self.run.lock() = RunState {
            shutdown: Some(shutdown),
            heartbeats: Some(heartbeat_root),
            loops,
        };
        *self.status.write() = WorkerPoolStatus::Running;

        info!(
            concurrency = config.concurrency,
            max_in_flight = config.max_in_flight,
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop polling and wait for in-flight attempts
    ///
    /// On timeout the loops are aborted and their heartbeat records are left
    /// to expire, so tasks still running show up as abandoned.
    #[instrument(skip(self), fields(pool_id = %self.ctx.config.pool_id))]
    pub async fn stop(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        let RunState {
            shutdown,
            heartbeats,
            loops,
        } = std::mem::take(&mut *self.run.lock());

        info!(
            in_flight = self.ctx.limiter.in_flight(),
            "Draining worker pool"
        );
        if let Some(shutdown) = shutdown {
            shutdown.cancel();
        }

        let aborts: Vec<_> = loops.iter().map(JoinHandle::abort_handle).collect();
        let timeout = self.ctx.config.shutdown_timeout;
        let joined = tokio::time::timeout(timeout, futures::future::join_all(loops)).await;

        if let Some(heartbeats) = heartbeats {
            heartbeats.cancel();
        }
        *self.status.write() = WorkerPoolStatus::Stopped;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Poll loop ended abnormally");
                    }
                }
                info!("Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    in_flight = self.ctx.limiter.in_flight(),
                    "Shutdown timed out, leaving heartbeats to expire"
                );
                for abort in aborts {
                    abort.abort();
                }
                Err(WorkerPoolError::ShutdownTimeout(timeout))
            }
        }
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn is_running(&self) -> bool {
        self.status() == WorkerPoolStatus::Running
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.ctx.limiter
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.ctx.config
    }

    /// Ids of the pool's poll loops
    pub fn worker_ids(&self) -> Vec<String> {
        (0..self.ctx.config.concurrency)
            .map(|n| self.ctx.config.worker_id(n))
            .collect()
    }

    /// Number of poll loops while running, zero otherwise
    pub fn active_workers(&self) -> usize {
        match self.status() {
            WorkerPoolStatus::Running | WorkerPoolStatus::Draining => self.ctx.config.concurrency,
            _ => 0,
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pool_id", &self.ctx.config.pool_id)
            .field("status", &self.status())
            .field("in_flight", &self.ctx.limiter.in_flight())
            .finish()
    }
}
