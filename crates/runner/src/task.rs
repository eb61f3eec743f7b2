use std::sync::Mutex;

use crate::error::TaskError;
use crate::resource::ResourceVector;

/// A unit of work the queue can dispatch.
///
/// Cost and priority are read once, at [`crate::PriorityWorkQueue::add`]
/// time; changing them afterwards has no effect on an already queued task.
pub trait QueueTask: Send {
    /// Stable name used in logs and error reports.
    fn name(&self) -> &str;

    /// Resource amounts this task occupies while running.
    fn cost(&self) -> ResourceVector {
        ResourceVector::new()
    }

    /// Larger values dispatch first among tasks whose cost currently fits.
    fn priority(&self) -> i64 {
        0
    }

    /// Executes the task on a worker thread.
    fn run(&self) -> Result<(), TaskError>;
}

type TaskFn = Box<dyn FnOnce() -> Result<(), TaskError> + Send>;

/// Adapts a one-shot closure into a [`QueueTask`].
pub struct FnTask {
    name: String,
    cost: ResourceVector,
    priority: i64,
    action: Mutex<Option<TaskFn>>,
}

impl FnTask {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        Self {
            name: name.into(),
            cost: ResourceVector::new(),
            priority: 0,
            action: Mutex::new(Some(Box::new(f))),
        }
    }

    #[must_use]
    pub fn with_cost(mut self, cost: ResourceVector) -> Self {
        self.cost = cost;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

impl QueueTask for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn cost(&self) -> ResourceVector {
        self.cost.clone()
    }

    fn priority(&self) -> i64 {
        self.priority
    }

    fn run(&self) -> Result<(), TaskError> {
        let action = self
            .action
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match action {
            Some(f) => f(),
            // The queue runs each task once, so a missing action only
            // happens if run() is called directly a second time.
            None => Ok(()),
        }
    }
}
