//! Poll loop and per-attempt execution
//!
//! One [`WorkerLoop`] per worker id. A loop holds at most one task at a time:
//! it takes a limiter slot, peeks the queue, claims the candidate and runs it
//! to an outcome before polling again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, field, info, info_span, trace, warn, Instrument, Span};

use super::heartbeat::Heartbeat;
use super::limiter::LimiterPermit;
use super::poller::PollCadence;
use super::pool::PoolContext;
use crate::events::TaskEventKind;
use crate::persistence::{RecordUpdate, StoreError};
use crate::task::{Task, TaskContext, TaskFailure, TaskFailureKind, TaskId, TaskStatus};

/// Attempts to persist an outcome before giving up on it
const OUTCOME_WRITE_RETRIES: u32 = 5;

/// First backoff step between outcome write attempts
const OUTCOME_WRITE_BACKOFF: Duration = Duration::from_millis(50);

enum PollOutcome {
    /// Task is ours and marked running
    Claimed(Task, CancellationToken),
    /// Nothing due
    Empty,
    /// Another loop won the candidate, or it changed under us
    Contended,
}

enum AttemptOutcome {
    Succeeded(serde_json::Value),
    Failed(TaskFailure),
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Failed(f) if f.kind == TaskFailureKind::Timeout => "timeout",
            Self::Failed(_) => "failed",
        }
    }
}

pub(crate) struct WorkerLoop {
    worker_id: String,
    ctx: Arc<PoolContext>,
    heartbeat: Heartbeat,
    heartbeat_stop: CancellationToken,
    shutdown: CancellationToken,
}

impl WorkerLoop {
    pub(crate) fn new(
        ctx: Arc<PoolContext>,
        heartbeat: Heartbeat,
        heartbeat_stop: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id: heartbeat.worker_id().to_string(),
            ctx,
            heartbeat,
            heartbeat_stop,
            shutdown,
        }
    }

    pub(crate) async fn run(self) {
        let heartbeat_handle = self.heartbeat.clone().spawn(self.heartbeat_stop.clone());
        let mut cadence = PollCadence::new(self.ctx.config.poller.clone());

        debug!(worker_id = %self.worker_id, "Poll loop started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.ctx.limiter.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.poll_once().await {
                Ok(PollOutcome::Claimed(task, token)) => {
                    cadence.record_work();
                    self.execute(task, token, permit).await;
                    continue;
                }
                Ok(PollOutcome::Contended) => {
                    drop(permit);
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(PollOutcome::Empty) => {
                    drop(permit);
                    cadence.record_idle();
                }
                Err(e) => {
                    drop(permit);
                    cadence.record_error();
                    warn!(
                        worker_id = %self.worker_id,
                        error = %e,
                        retry_in_ms = cadence.current_interval().as_millis() as u64,
                        "Poll failed"
                    );
                }
            }

            if cadence.wait(&self.shutdown).await {
                break;
            }
        }

        self.heartbeat_stop.cancel();
        if let Err(e) = heartbeat_handle.await {
            warn!(worker_id = %self.worker_id, error = %e, "Heartbeat task ended abnormally");
        }
        if let Err(e) = self.heartbeat.clear().await {
            warn!(worker_id = %self.worker_id, error = %e, "Failed to clear heartbeat record");
        }

        debug!(worker_id = %self.worker_id, "Poll loop exited");
    }

    /// Peek, claim and mark running
    async fn poll_once(&self) -> Result<PollOutcome, StoreError> {
        let Some(candidate) = self.ctx.queue.peek_next().await? else {
            return Ok(PollOutcome::Empty);
        };

        if !self.ctx.queue.claim(&candidate).await? {
            trace!(worker_id = %self.worker_id, task_id = %candidate.id, "Lost claim race");
            return Ok(PollOutcome::Contended);
        }

        // Registered before the record says running, so a cancel that sees
        // `running` always finds the token
        let token = self.ctx.in_flight.register(candidate.id);
        let now = Utc::now();
        let worker_id = self.worker_id.clone();

        let update = self
            .ctx
            .records
            .update(candidate.id, |task| {
                if !task.status.is_dispatchable() || !task.has_attempts_remaining() {
                    return false;
                }
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.started_at.get_or_insert(now);
                task.last_attempt_started_at = Some(now);
                task.worker_id = Some(worker_id.clone());
                task.next_attempt_at = None;
                true
            })
            .await;

        match update {
            Ok(RecordUpdate::Updated(task)) => {
                if let Err(e) = self.ctx.queue.mark_running(task.id, now).await {
                    warn!(task_id = %task.id, error = %e, "Failed to index running task");
                }
                Ok(PollOutcome::Claimed(task, token))
            }
            Ok(RecordUpdate::Unchanged(task)) => {
                self.ctx.in_flight.finish(candidate.id);
                debug!(
                    task_id = %task.id,
                    status = %task.status,
                    attempts = task.attempts,
                    "Claimed task is no longer dispatchable"
                );
                Ok(PollOutcome::Contended)
            }
            Ok(RecordUpdate::NotFound) => {
                self.ctx.in_flight.finish(candidate.id);
                debug!(task_id = %candidate.id, "Claimed task record vanished");
                Ok(PollOutcome::Contended)
            }
            Err(e) => {
                self.ctx.in_flight.finish(candidate.id);
                // Put it back so the task is not stranded outside the queue
                if let Err(requeue) = self
                    .ctx
                    .queue
                    .add_to_queue(candidate.id, candidate.priority, candidate.due_at())
                    .await
                {
                    error!(task_id = %candidate.id, error = %requeue, "Failed to return claimed task to the queue");
                }
                Err(e)
            }
        }
    }

    async fn execute(&self, task: Task, token: CancellationToken, permit: LimiterPermit) {
        let span = info_span!(
            "task.execute",
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            attempt = task.attempts,
            worker_id = %self.worker_id,
            outcome = field::Empty,
        );

        async move {
            let _permit = permit;

            self.ctx.events.emit(TaskEventKind::TaskStarted {
                task_id: task.id,
                task_type: task.task_type.clone(),
                worker_id: self.worker_id.clone(),
                attempt: task.attempts,
            });
            debug!("Executing task");

            let started = Instant::now();
            let outcome = self.invoke(&task, token).await;
            let elapsed = started.elapsed();
            self.ctx.in_flight.finish(task.id);

            Span::current().record("outcome", outcome.label());

            match outcome {
                AttemptOutcome::Succeeded(value) => self.complete(&task, value, elapsed).await,
                AttemptOutcome::Failed(failure) => self.fail_attempt(&task, failure).await,
            }

            if let Err(e) = self.ctx.queue.clear_running(task.id).await {
                warn!(error = %e, "Failed to clear running index entry");
            }
        }
        .instrument(span)
        .await
    }

    /// Run the handler against the attempt timeout
    ///
    /// The handler runs on its own task so a panic becomes a failure. On
    /// timeout the token is cancelled and the handler left to wind down.
    async fn invoke(&self, task: &Task, token: CancellationToken) -> AttemptOutcome {
        let Some(handler) = self.ctx.registry.get(&task.task_type) else {
            warn!("No handler registered for task type");
            return AttemptOutcome::Failed(TaskFailure::attempt(
                TaskFailureKind::HandlerNotRegistered,
                format!("no handler registered for task type '{}'", task.task_type),
                task.attempts,
                task.max_attempts,
            ));
        };

        let ctx = TaskContext::new(task.clone(), self.worker_id.clone(), token.clone());
        let handle = tokio::spawn(async move { handler.handle(ctx).await }.in_current_span());

        match tokio::time::timeout(task.timeout, handle).await {
            Ok(Ok(Ok(value))) => AttemptOutcome::Succeeded(value),
            Ok(Ok(Err(err))) => {
                if let Some(ref details) = err.details {
                    debug!(details = %details, "Handler error details");
                }
                let failure = TaskFailure::attempt(
                    TaskFailureKind::Handler,
                    err.message,
                    task.attempts,
                    task.max_attempts,
                );
                AttemptOutcome::Failed(if err.retryable {
                    failure
                } else {
                    failure.non_retryable()
                })
            }
            Ok(Err(join_err)) => {
                let message = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "handler task was cancelled".to_string()
                };
                error!(panic = %message, "Handler panicked");
                AttemptOutcome::Failed(TaskFailure::attempt(
                    TaskFailureKind::Panicked,
                    format!("handler panicked: {message}"),
                    task.attempts,
                    task.max_attempts,
                ))
            }
            Err(_) => {
                token.cancel();
                AttemptOutcome::Failed(TaskFailure::attempt(
                    TaskFailureKind::Timeout,
                    format!("attempt timed out after {}ms", task.timeout.as_millis()),
                    task.attempts,
                    task.max_attempts,
                ))
            }
        }
    }

    async fn complete(&self, task: &Task, value: serde_json::Value, elapsed: Duration) {
        let now = Utc::now();
        let attempt = task.attempts;
        let worker_id = self.worker_id.as_str();

        let update = self
            .write_outcome(task.id, |t| {
                if !owns_attempt(t, attempt, worker_id) {
                    return false;
                }
                t.status = TaskStatus::Completed;
                t.completed_at.get_or_insert(now);
                t.result = Some(value.clone());
                t.error = None;
                t.next_attempt_at = None;
                true
            })
            .await;

        match update {
            Some(RecordUpdate::Updated(_)) => {
                self.ctx.events.emit(TaskEventKind::TaskCompleted {
                    task_id: task.id,
                    task_type: task.task_type.clone(),
                    attempts: attempt,
                    duration_ms: elapsed.as_millis() as u64,
                });
                info!(duration_ms = elapsed.as_millis() as u64, "Task completed");
            }
            Some(RecordUpdate::Unchanged(current)) => {
                info!(status = %current.status, "Discarding result, task changed while running");
            }
            Some(RecordUpdate::NotFound) => {
                warn!("Task record vanished while running");
            }
            None => {}
        }
    }

    async fn fail_attempt(&self, task: &Task, mut failure: TaskFailure) {
        let now = Utc::now();
        let attempt = task.attempts;
        let worker_id = self.worker_id.as_str();

        if failure.retryable && task.attempts < task.max_attempts {
            let delay = self.ctx.config.retry.delay_for_attempt(attempt);
            let Some(retry_at) = retry_time(now, delay) else {
                warn!(delay_ms = delay.as_millis() as u64, "Retry delay out of range, failing task");
                failure.message = format!(
                    "{} (retry delay of {}s is out of range)",
                    failure.message,
                    delay.as_secs()
                );
                return self.fail_terminally(task, failure.non_retryable(), now).await;
            };

            let update = self
                .write_outcome(task.id, |t| {
                    if !owns_attempt(t, attempt, worker_id) {
                        return false;
                    }
                    t.status = TaskStatus::Retrying;
                    t.error = Some(failure.clone());
                    t.next_attempt_at = Some(retry_at);
                    true
                })
                .await;

            match update {
                Some(RecordUpdate::Updated(_)) => {
                    self.requeue(task, retry_at).await;
                    self.ctx.events.emit(TaskEventKind::TaskRetrying {
                        task_id: task.id,
                        task_type: task.task_type.clone(),
                        attempt,
                        error: failure.message.clone(),
                        delay_ms: delay.as_millis() as u64,
                        retry_at,
                    });
                    warn!(
                        error = %failure.message,
                        kind = %failure.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retry scheduled"
                    );
                }
                Some(RecordUpdate::Unchanged(current)) => {
                    info!(status = %current.status, error = %failure.message, "Discarding failure, task changed while running");
                }
                Some(RecordUpdate::NotFound) => warn!("Task record vanished while running"),
                None => {}
            }
            return;
        }

        self.fail_terminally(task, failure, now).await;
    }

    async fn fail_terminally(&self, task: &Task, failure: TaskFailure, now: DateTime<Utc>) {
        let attempt = task.attempts;
        let worker_id = self.worker_id.as_str();
        let terminal = TaskFailure::terminal(&failure);
        let update = self
            .write_outcome(task.id, |t| {
                if !owns_attempt(t, attempt, worker_id) {
                    return false;
                }
                t.status = TaskStatus::Failed;
                t.completed_at.get_or_insert(now);
                t.error = Some(terminal.clone());
                t.result = None;
                t.next_attempt_at = None;
                true
            })
            .await;

        match update {
            Some(RecordUpdate::Updated(_)) => {
                self.ctx.events.emit(TaskEventKind::TaskFailed {
                    task_id: task.id,
                    task_type: task.task_type.clone(),
                    attempts: attempt,
                    error: terminal.message.clone(),
                });
                error!(error = %terminal.message, kind = %failure.kind, "Task failed");
            }
            Some(RecordUpdate::Unchanged(current)) => {
                info!(status = %current.status, error = %failure.message, "Discarding failure, task changed while running");
            }
            Some(RecordUpdate::NotFound) => warn!("Task record vanished while running"),
            None => {}
        }
    }

    /// Persist an outcome, retrying store errors with backoff
    async fn write_outcome<F>(&self, task_id: TaskId, mut mutate: F) -> Option<RecordUpdate>
    where
        F: FnMut(&mut Task) -> bool,
    {
        let mut attempt = 0;
        loop {
            match self.ctx.records.update(task_id, &mut mutate).await {
                Ok(update) => return Some(update),
                Err(e) if attempt < OUTCOME_WRITE_RETRIES => {
                    warn!(error = %e, attempt, "Outcome write failed, retrying");
                    tokio::time::sleep(OUTCOME_WRITE_BACKOFF * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = %e, "Giving up on outcome write, task stays running");
                    return None;
                }
            }
        }
    }

    async fn requeue(&self, task: &Task, due_at: DateTime<Utc>) {
        let mut attempt = 0;
        loop {
            match self
                .ctx
                .queue
                .add_to_queue(task.id, task.priority, due_at)
                .await
            {
                Ok(()) => return,
                Err(e) if attempt < OUTCOME_WRITE_RETRIES => {
                    warn!(error = %e, attempt, "Re-enqueue failed, retrying");
                    tokio::time::sleep(OUTCOME_WRITE_BACKOFF * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(error = %e, "Giving up on re-enqueue, retrying task will not be dispatched");
                    return;
                }
            }
        }
    }
}

/// Is the record still the attempt this loop started?
fn owns_attempt(task: &Task, attempt: u32, worker_id: &str) -> bool {
    task.status == TaskStatus::Running
        && task.attempts == attempt
        && task.worker_id.as_deref() == Some(worker_id)
}

/// When the next attempt is due, or `None` if `delay` puts it past the calendar
fn retry_time(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay).ok()?;
    now.checked_add_signed(delay)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owns_attempt() {
        let mut task = Task::new("t", serde_json::Value::Null);
        task.status = TaskStatus::Running;
        task.attempts = 2;
        task.worker_id = Some("pool-0".to_string());

        assert!(owns_attempt(&task, 2, "pool-0"));
        assert!(!owns_attempt(&task, 1, "pool-0"));
        assert!(!owns_attempt(&task, 2, "pool-1"));

        task.status = TaskStatus::Cancelled;
        assert!(!owns_attempt(&task, 2, "pool-0"));
    }

    #[test]
    fn test_retry_time_rejects_overflow() {
        let now = Utc::now();
        assert_eq!(
            retry_time(now, Duration::from_secs(5)),
            Some(now + chrono::Duration::seconds(5))
        );
        assert_eq!(retry_time(now, Duration::from_secs(9_000_000_000_000)), None);
        assert_eq!(retry_time(now, Duration::MAX), None);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("bang".to_string())), "bang");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
