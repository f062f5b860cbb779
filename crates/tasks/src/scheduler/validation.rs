//! Scheduling input checks that need no store access

use std::collections::HashSet;
use std::time::Duration;

use super::SchedulerError;
use crate::task::{ScheduleOptions, TaskPriority, DEFAULT_MAX_ATTEMPTS, DEFAULT_TASK_TIMEOUT};

/// Longest accepted scheduling delay
pub const MAX_SCHEDULE_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Engine defaults applied to unset options
#[derive(Debug, Clone)]
pub struct ScheduleDefaults {
    pub max_attempts: u32,
    pub timeout: Duration,
}

impl Default for ScheduleDefaults {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: DEFAULT_TASK_TIMEOUT,
        }
    }
}

/// Options with defaults applied
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub priority: TaskPriority,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub delay: Duration,
}

pub(crate) fn validate(
    task_type: &str,
    options: &ScheduleOptions,
    defaults: &ScheduleDefaults,
) -> Result<ResolvedOptions, SchedulerError> {
    if task_type.trim().is_empty() {
        return Err(SchedulerError::Validation("task type must not be empty".into()));
    }

    let max_attempts = options.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        return Err(SchedulerError::Validation("max_attempts must be at least 1".into()));
    }

    let timeout = options.timeout.unwrap_or(defaults.timeout);
    if timeout.is_zero() {
        return Err(SchedulerError::Validation("timeout must be positive".into()));
    }

    let delay = options.delay.unwrap_or(Duration::ZERO);
    if delay > MAX_SCHEDULE_DELAY {
        return Err(SchedulerError::Validation(format!(
            "delay of {}s exceeds the {}s maximum",
            delay.as_secs(),
            MAX_SCHEDULE_DELAY.as_secs()
        )));
    }

    let mut seen = HashSet::new();
    for dep in &options.dependencies {
        if !seen.insert(dep) {
            return Err(SchedulerError::Validation(format!(
                "dependency {dep} listed more than once"
            )));
        }
    }

    Ok(ResolvedOptions {
        priority: options.priority.unwrap_or_default(),
        max_attempts,
        timeout,
        delay,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    fn defaults() -> ScheduleDefaults {
        ScheduleDefaults {
            max_attempts: 3,
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let resolved = validate("encode", &ScheduleOptions::new(), &defaults()).unwrap();
        assert_eq!(resolved.priority, TaskPriority::Medium);
        assert_eq!(resolved.max_attempts, 3);
        assert_eq!(resolved.timeout, Duration::from_secs(60));
        assert_eq!(resolved.delay, Duration::ZERO);
    }

    #[test]
    fn test_rejections() {
        let d = defaults();
        assert!(matches!(
            validate("  ", &ScheduleOptions::new(), &d),
            Err(SchedulerError::Validation(_))
        ));
        assert!(validate("t", &ScheduleOptions::new().with_max_attempts(0), &d).is_err());
        assert!(validate("t", &ScheduleOptions::new().with_timeout(Duration::ZERO), &d).is_err());
        assert!(validate(
            "t",
            &ScheduleOptions::new().with_delay(MAX_SCHEDULE_DELAY + Duration::from_secs(1)),
            &d
        )
        .is_err());

        let dep = TaskId::new();
        let err = validate(
            "t",
            &ScheduleOptions::new().with_dependency(dep).with_dependency(dep),
            &d,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
