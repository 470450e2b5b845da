//! Thread-local tracking of the task whose execution slice is in flight.
//!
//! The step loop installs the task for the duration of each slice via
//! [`CurrentTaskScope`]; the guard restores the previous value on every exit
//! path, including unwinding. Everything the running task may do to itself
//! (sleep, toggle cancellability, read its own id) resolves through here.

use crate::task::{Id, TaskContext};
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<TaskContext>>> = const { RefCell::new(None) };
}

/// Installs `task` as the thread's current task until dropped.
pub(crate) struct CurrentTaskScope {
    prev: Option<Arc<TaskContext>>,
}

impl CurrentTaskScope {
    pub(crate) fn enter(task: Arc<TaskContext>) -> Self {
        let prev = CURRENT_TASK.with(|cell| cell.borrow_mut().replace(task));
        CurrentTaskScope { prev }
    }
}

impl Drop for CurrentTaskScope {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = prev);
    }
}

/// Returns the task currently executing on this thread, or `None` when called
/// from outside any task's execution slice.
pub fn try_current_task() -> Option<Arc<TaskContext>> {
    CURRENT_TASK.with(|cell| cell.borrow().clone())
}

/// Returns the task currently executing on this thread.
///
/// # Panics
///
/// Panics when called from outside a task's execution slice.
pub fn current_task() -> Arc<TaskContext> {
    try_current_task().expect("not running inside a task")
}

pub(crate) fn current_task_id() -> Option<Id> {
    CURRENT_TASK.with(|cell| cell.borrow().as_ref().map(|task| task.id()))
}
