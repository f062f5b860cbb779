//! Handler registry keyed by task type

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::task::TaskHandler;

/// Registry of task handlers
///
/// One handler per task type; registering again replaces the previous
/// handler. Looked up by workers at dispatch time, so registration may
/// happen before or after the pool starts.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Returns true if it replaced an existing one.
    pub fn register<H: TaskHandler>(&self, task_type: impl Into<String>, handler: H) -> bool {
        self.register_arc(task_type, Arc::new(handler))
    }

    pub fn register_arc(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) -> bool {
        let task_type = task_type.into();
        let replaced = self
            .handlers
            .write()
            .insert(task_type.clone(), handler)
            .is_some();

        if replaced {
            warn!(task_type = %task_type, "Replaced existing task handler");
        } else {
            debug!(task_type = %task_type, "Registered task handler");
        }
        replaced
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}
