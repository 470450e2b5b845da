//! Cooperative cancellation: reasons, tokens and per-task cancellability.
//!
//! Cancellation never preempts a task. A request merely records a
//! [`CancellationReason`] on the target and wakes it if it sleeps; the task
//! observes the request at its next cancellation point (sleep entry,
//! [`checkpoint`], or an explicit [`is_cancel_requested`] poll) and unwinds by
//! dropping its payload.

use crate::context;
use crate::task::TaskContext;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll};

/// Why a task was asked to cancel.
///
/// The first recorded reason wins; later requests on the same task keep the
/// original reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CancellationReason {
    /// Explicit request through a handle or token.
    UserRequest = 1,
    /// The task's cancellation deadline was reached.
    Deadline,
    /// The task processor shed the task under overload.
    Overload,
    /// No coroutine could be acquired to run the task.
    OutOfMemory,
    /// Every handle to the task was dropped before it finished.
    Abandoned,
    /// The task processor is shutting down.
    Shutdown,
}

impl CancellationReason {
    fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => CancellationReason::UserRequest,
            2 => CancellationReason::Deadline,
            3 => CancellationReason::Overload,
            4 => CancellationReason::OutOfMemory,
            5 => CancellationReason::Abandoned,
            6 => CancellationReason::Shutdown,
            _ => return None,
        })
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CancellationReason::UserRequest => "user request",
            CancellationReason::Deadline => "task deadline reached",
            CancellationReason::Overload => "task processor overload",
            CancellationReason::OutOfMemory => "not enough memory",
            CancellationReason::Abandoned => "task handle dropped before the payload finished",
            CancellationReason::Shutdown => "task processor shutdown",
        };
        f.write_str(text)
    }
}

/// Set-once slot for a task's cancellation reason.
///
/// Zero means "no reason recorded". The first successful CAS wins and later
/// writers observe `try_set` returning `false`.
pub(crate) struct ReasonSlot(AtomicU8);

impl ReasonSlot {
    pub(crate) fn new() -> Self {
        ReasonSlot(AtomicU8::new(0))
    }

    /// Records `reason` unless one is already recorded. Returns whether this
    /// call was the first writer.
    pub(crate) fn try_set(&self, reason: CancellationReason) -> bool {
        self.0
            .compare_exchange(0, reason as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn get(&self) -> Option<CancellationReason> {
        CancellationReason::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Cheaply cloneable handle for requesting and observing cancellation of one
/// task. Unlike a task handle it confers no access to the task's result and
/// holding it does not keep the task from being abandoned.
#[derive(Clone)]
pub struct CancellationToken {
    context: Arc<TaskContext>,
}

impl CancellationToken {
    pub(crate) fn new(context: Arc<TaskContext>) -> Self {
        CancellationToken { context }
    }

    /// Requests cancellation with [`CancellationReason::UserRequest`].
    pub fn cancel(&self) {
        self.context.request_cancel(CancellationReason::UserRequest);
    }

    /// Whether cancellation of the task has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        self.context.is_cancel_requested()
    }

    /// The recorded reason, if cancellation was requested.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.context.cancellation_reason()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("task", &self.context.id())
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

/// Whether cancellation of the current task has been requested.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn is_cancel_requested() -> bool {
    context::current_task().is_cancel_requested()
}

/// Whether the current task should act on a cancellation request, i.e. one is
/// pending and the task is cancellable.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn should_cancel() -> bool {
    context::current_task().should_cancel()
}

/// Toggles whether the current task honors cancellation requests at its
/// cancellation points. Returns the previous value. Requests arriving while
/// disabled are not lost; they take effect once re-enabled.
///
/// Prefer [`CancellationBlocker`] over calling this in pairs.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn set_cancellable(value: bool) -> bool {
    context::current_task().set_cancellable(value)
}

/// Guard that makes the current task non-cancellable for its lifetime.
///
/// Restores the previous cancellability on drop, so blockers nest.
pub struct CancellationBlocker {
    context: Arc<TaskContext>,
    was_cancellable: bool,
}

impl CancellationBlocker {
    /// # Panics
    ///
    /// Panics when called from outside a task.
    pub fn new() -> Self {
        let context = context::current_task();
        let was_cancellable = context.set_cancellable(false);
        CancellationBlocker {
            context,
            was_cancellable,
        }
    }
}

impl Default for CancellationBlocker {
    fn default() -> Self {
        CancellationBlocker::new()
    }
}

impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        self.context.set_cancellable(self.was_cancellable);
    }
}

/// A cancellation point: completes immediately when the current task need not
/// cancel, otherwise unwinds the task.
///
/// ```ignore
/// for chunk in chunks {
///     process(chunk).await;
///     strand::checkpoint().await;
/// }
/// ```
pub fn checkpoint() -> Checkpoint {
    Checkpoint { _private: () }
}

pub struct Checkpoint {
    _private: (),
}

impl Future for Checkpoint {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let task = context::current_task();
        if task.should_cancel() {
            task.begin_cancellation_unwind();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}
