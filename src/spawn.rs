//! Provides functions and types for spawning new tasks onto a processor.
//!
//! Tasks can be spawned using the simple [`spawn_on()`] function for default
//! behavior, or configured using the [`TaskBuilder`] for more control.
//!
//! The [`TaskBuilder`] allows you to set [`TaskOpts`] (like criticality under
//! overload) and a cancellation deadline for the whole task.

use crate::deadline::Deadline;
use crate::processor::TaskProcessor;
use crate::task::payload::{Payload, ResultSlot, TypedPayload};
use crate::task::{SharedTaskHandle, TaskContext, TaskHandle};
use bitflags::bitflags;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Spawns a new task with default options.
///
/// This is a convenience function for [`TaskBuilder::spawn_on`].
///
/// The task starts running immediately; the returned handle joins on it.
/// Dropping the handle cancels the task unless it was
/// [detached](TaskHandle::detach) first.
pub fn spawn_on<F>(processor: Arc<dyn TaskProcessor>, future: F) -> TaskHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    TaskBuilder::new().spawn_on(processor, future)
}

/// Spawns a new task whose result every clone of the returned handle can
/// read. See [`TaskBuilder::spawn_shared_on`].
pub fn spawn_shared_on<F>(
    processor: Arc<dyn TaskProcessor>,
    future: F,
) -> SharedTaskHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Clone + Send + 'static,
{
    TaskBuilder::new().spawn_shared_on(processor, future)
}

bitflags! {
    /// Configuration options for a new task.
    ///
    /// Passed to the processor via [`TaskBuilder::with_opts`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct TaskOpts: u8 {
        /// The task is scheduled even when the processor is overloaded.
        ///
        /// Non-critical tasks get cancelled with
        /// [`CancellationReason::Overload`] when the run queue grows past the
        /// processor's shed watermark; critical tasks are exempt.
        ///
        /// [`CancellationReason::Overload`]: crate::cancel::CancellationReason::Overload
        const CRITICAL = 1;
    }
}

impl TaskOpts {
    pub(crate) fn is_critical(&self) -> bool {
        self.contains(TaskOpts::CRITICAL)
    }
}

/// A builder for configuring and spawning a new task.
#[derive(Debug, Clone, Default)]
pub struct TaskBuilder {
    opts: TaskOpts,
    cancel_deadline: Deadline,
}

impl TaskBuilder {
    pub fn new() -> Self {
        TaskBuilder::default()
    }

    /// Sets the [`TaskOpts`] for the new task.
    pub fn with_opts(mut self, opts: TaskOpts) -> Self {
        self.opts = opts;
        self
    }

    /// Bounds the whole task: when `deadline` passes, cancellation with
    /// [`CancellationReason::Deadline`] is requested automatically.
    ///
    /// [`CancellationReason::Deadline`]: crate::cancel::CancellationReason::Deadline
    pub fn with_cancel_deadline(mut self, deadline: Deadline) -> Self {
        self.cancel_deadline = deadline;
        self
    }

    /// Spawns the task with the configured options and starts it.
    pub fn spawn_on<F>(self, processor: Arc<dyn TaskProcessor>, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (task, result) = spawn_with(processor, self.opts, self.cancel_deadline, future);
        task.start();
        TaskHandle::new(task, result)
    }

    /// Spawns the task and hands out a cloneable handle. The output type must
    /// be `Clone` so every holder can read the result.
    pub fn spawn_shared_on<F>(
        self,
        processor: Arc<dyn TaskProcessor>,
        future: F,
    ) -> SharedTaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Clone + Send + 'static,
    {
        let (task, result) = spawn_with(processor, self.opts, self.cancel_deadline, future);
        task.start();
        SharedTaskHandle::new(task, result)
    }
}

/// Creates and adopts a task without starting it. The caller decides when the
/// bootstrap wakeup happens; tests use this to drive tasks step by step.
pub(crate) fn spawn_with<F>(
    processor: Arc<dyn TaskProcessor>,
    opts: TaskOpts,
    cancel_deadline: Deadline,
    future: F,
) -> (Arc<TaskContext>, Arc<ResultSlot<F::Output>>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let result = ResultSlot::new();
    let payload: Pin<Box<dyn Payload>> = Box::pin(TypedPayload::new(future, result.clone()));
    let task = TaskContext::new(processor, opts.is_critical(), cancel_deadline, payload);
    task.processor().adopt(&task);
    (task, result)
}
