//! Task records and the values that describe them

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serde_util::{duration_millis, option_duration_millis};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Unique task identifier
///
/// UUID v7, so the string form sorts by creation time. The queue uses the
/// string form as its tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority class of a task
///
/// Variants are declared in dispatch order, so the derived `Ord` sorts
/// `Critical` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl TaskPriority {
    /// All classes, highest first
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
    ];

    /// Weight used in the queue score. Higher wins.
    pub fn weight(self) -> i64 {
        match self {
            Self::Critical => 4,
            Self::High => 3,
            Self::Medium => 2,
            Self::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown priority name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid priority '{0}' (expected critical, high, medium or low)")]
pub struct InvalidPriority(pub String);

impl FromStr for TaskPriority {
    type Err = InvalidPriority;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(InvalidPriority(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue for its first attempt
    Pending,
    /// A worker is executing an attempt
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Exhausted its attempts or failed non-retryably. Terminal.
    Failed,
    /// Cancelled explicitly. Terminal.
    Cancelled,
    /// Last attempt failed; waiting in the queue for the next one
    Retrying,
}

impl TaskStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            // A retry waits as Retrying and is dispatched straight from there
            (Pending, Running)
                | (Retrying, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled) // bookkeeping only, the handler keeps running
                | (Pending, Cancelled)
                | (Retrying, Cancelled)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// May a worker pick this task up (ignoring due time and dependencies)?
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Pending | Self::Retrying)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// What went wrong on an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureKind {
    /// The handler returned an error
    Handler,
    /// The attempt exceeded its timeout
    Timeout,
    /// No handler was registered for the task type at dispatch time
    HandlerNotRegistered,
    /// The handler panicked
    Panicked,
    /// Terminal summary once no further attempt will be made
    Exhausted,
}

impl fmt::Display for TaskFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Handler => "handler_error",
            Self::Timeout => "timeout",
            Self::HandlerNotRegistered => "handler_not_registered",
            Self::Panicked => "panicked",
            Self::Exhausted => "exhausted",
        };
        f.write_str(s)
    }
}

/// Error recorded on a task
///
/// While retrying this holds the latest attempt's failure. Once the task is
/// `failed` the message is a summary naming the attempt count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: TaskFailureKind,
    /// Kind of the last attempt's failure, set on terminal summaries
    #[serde(default)]
    pub cause: Option<TaskFailureKind>,
    /// Human-readable description
    pub message: String,
    /// Attempt number the failure belongs to (1-based)
    pub attempt: u32,
    /// Ceiling on attempts for the task
    pub max_attempts: u32,
    /// Whether the handler marked the error retryable
    pub retryable: bool,
    pub failed_at: DateTime<Utc>,
}

impl TaskFailure {
    /// Failure of a single attempt
    pub fn attempt(
        kind: TaskFailureKind,
        message: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            kind,
            cause: None,
            message: message.into(),
            attempt,
            max_attempts,
            retryable: true,
            failed_at: Utc::now(),
        }
    }

    /// Mark the failure as not worth retrying
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Terminal summary built from the last attempt's failure
    pub fn terminal(last: &TaskFailure) -> Self {
        let message = if last.retryable {
            format!(
                "exhausted {}/{} attempts: {}",
                last.attempt, last.max_attempts, last.message
            )
        } else {
            format!(
                "non-retryable failure after {} of {} attempts: {}",
                last.attempt, last.max_attempts, last.message
            )
        };

        Self {
            kind: TaskFailureKind::Exhausted,
            cause: Some(last.cause.unwrap_or(last.kind)),
            message,
            attempt: last.attempt,
            max_attempts: last.max_attempts,
            retryable: last.retryable,
            failed_at: last.failed_at,
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A schedulable, retryable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Key selecting the registered handler
    pub task_type: String,

    /// Opaque data passed to the handler
    pub payload: serde_json::Value,

    pub priority: TaskPriority,

    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Attempts made so far, incremented right before each handler call
    pub attempts: u32,
    pub max_attempts: u32,

    /// Per-attempt wall-clock budget
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Caller data, never interpreted by the engine
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Tasks that must complete before this one is dispatched
    #[serde(default)]
    pub dependencies: Vec<TaskId>,

    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,

    /// When the pending retry becomes due
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,

    /// Start of the most recent attempt
    #[serde(default)]
    pub last_attempt_started_at: Option<DateTime<Utc>>,

    /// Poll loop that ran (or is running) the most recent attempt
    #[serde(default)]
    pub worker_id: Option<String>,
}

/// Attempts allowed when the caller does not say otherwise
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Per-attempt budget when neither caller nor config say otherwise
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

impl Task {
    /// New pending task due immediately, with default priority and limits
    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            created_at: now,
            scheduled_at: Some(now),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TASK_TIMEOUT,
            tags: BTreeSet::new(),
            metadata: serde_json::Value::Null,
            dependencies: Vec::new(),
            result: None,
            error: None,
            next_attempt_at: None,
            last_attempt_started_at: None,
            worker_id: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Time at which the task becomes due for its next dispatch
    pub fn due_at(&self) -> DateTime<Utc> {
        self.next_attempt_at
            .or(self.scheduled_at)
            .unwrap_or(self.created_at)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Terminal outcome, if any
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.status {
            TaskStatus::Completed => Some(TaskOutcome::Completed(
                self.result.clone().unwrap_or(serde_json::Value::Null),
            )),
            TaskStatus::Failed => self.error.clone().map(TaskOutcome::Failed),
            TaskStatus::Cancelled => Some(TaskOutcome::Cancelled),
            _ => None,
        }
    }
}

/// Terminal result of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed(serde_json::Value),
    Failed(TaskFailure),
    Cancelled,
}

// ---------------------------------------------------------------------------
// Scheduling options
// ---------------------------------------------------------------------------

/// Options accepted when scheduling a task
///
/// Every field is optional; unset fields take the engine defaults.
///
/// # Example
///
/// ```
/// use castplan_tasks::task::{ScheduleOptions, TaskPriority};
/// use std::time::Duration;
///
/// let options = ScheduleOptions::new()
///     .with_priority(TaskPriority::High)
///     .with_max_attempts(5)
///     .with_delay(Duration::from_secs(30))
///     .with_tag("docs");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleOptions {
    pub priority: Option<TaskPriority>,

    pub max_attempts: Option<u32>,

    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,

    #[serde(default, with = "option_duration_millis")]
    pub delay: Option<Duration>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    pub metadata: Option<serde_json::Value>,

    #[serde(default)]
    pub dependencies: Vec<TaskId>,
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_dependency(mut self, task_id: TaskId) -> Self {
        self.dependencies.push(task_id);
        self
    }

    pub fn with_dependencies(mut self, task_ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies.extend(task_ids);
        self
    }
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<String>,
    pub tag: Option<String>,
}

impl TaskFilter {
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(ref task_type) = self.task_type {
            if &task.task_type != task_type {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !task.tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_and_weight() {
        let mut shuffled = vec![
            TaskPriority::Low,
            TaskPriority::Critical,
            TaskPriority::Medium,
            TaskPriority::High,
        ];
        shuffled.sort();
        assert_eq!(shuffled, TaskPriority::ALL.to_vec());

        for pair in TaskPriority::ALL.windows(2) {
            assert!(pair[0].weight() > pair[1].weight());
        }
    }

    #[test]
    fn test_priority_parsing() {
        assert_eq!("HIGH".parse::<TaskPriority>(), Ok(TaskPriority::High));
        assert_eq!(" low ".parse::<TaskPriority>(), Ok(TaskPriority::Low));
        assert!("urgent".parse::<TaskPriority>().is_err());
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));

        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Retrying.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(TaskStatus::Retrying.is_dispatchable());
        assert!(!TaskStatus::Running.is_dispatchable());
    }

    #[test]
    fn test_terminal_failure_summary_names_attempts() {
        let last = TaskFailure::attempt(TaskFailureKind::Timeout, "timed out after 5s", 3, 3);
        let terminal = TaskFailure::terminal(&last);

        assert_eq!(terminal.kind, TaskFailureKind::Exhausted);
        assert_eq!(terminal.cause, Some(TaskFailureKind::Timeout));
        assert_eq!(terminal.message, "exhausted 3/3 attempts: timed out after 5s");

        let fatal = TaskFailure::attempt(TaskFailureKind::Handler, "bad input", 1, 3).non_retryable();
        let terminal = TaskFailure::terminal(&fatal);
        assert!(terminal.message.contains("after 1 of 3 attempts"));
        assert!(terminal.message.contains("bad input"));
    }

    #[test]
    fn test_task_id_string_order_follows_creation() {
        let first = TaskId::new();
        let second = TaskId::new();
        assert!(first.to_string() < second.to_string());
        assert_eq!(first.to_string().parse::<TaskId>().unwrap(), first);
    }

    #[test]
    fn test_schedule_options_serialization() {
        let options = ScheduleOptions::new()
            .with_priority(TaskPriority::Critical)
            .with_timeout(Duration::from_millis(1500))
            .with_tag("nightly");

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["priority"], "critical");
        assert_eq!(json["timeout"], 1500);

        let parsed: ScheduleOptions = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, options);
    }
}
