//! Name → task lookup used to resolve a run request.

use std::collections::HashMap;
use std::sync::Arc;

use super::Task;
use crate::error::{CalibError, CalibResult};

/// Registry for calibration tasks.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    /// Create a new empty task registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task. A later registration under the same name wins.
    pub fn register(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.insert(task.name().to_string(), task);
        self
    }

    /// Register a task from a type that implements `Task`.
    pub fn register_task<T: Task + 'static>(mut self, task: T) -> Self {
        self.tasks.insert(task.name().to_string(), Arc::new(task));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    /// Look up every name, preserving order. The first unknown name fails.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> CalibResult<Vec<Arc<dyn Task>>> {
        names
            .iter()
            .map(|name| {
                self.get(name.as_ref()).ok_or_else(|| CalibError::TaskNotFound {
                    name: name.as_ref().to_string(),
                })
            })
            .collect()
    }

    /// List all registered task names, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
