use crate::cancel::{CancellationReason, CancellationToken};
use crate::context;
use crate::deadline::Deadline;
use crate::task::error::{SharedTaskError, TaskError};
use crate::task::payload::ResultSlot;
use crate::task::state::ExecutionState;
use crate::task::wakeup::WakeupSource;
use crate::task::{Id, TaskContext};
use crate::wait_list::next_waiter_key;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread::{self, Thread};

/// How a bounded wait for task completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The task reached a terminal state.
    Ready,
    /// The wait deadline passed first.
    Timeout,
    /// The waiting task was cancelled.
    Cancelled,
}

/// An owned permission to join on a task (await its termination).
///
/// The task starts running as soon as it is spawned, whether or not the
/// handle is awaited. Awaiting the handle yields the payload's output, or a
/// [`TaskError`] if the task was cancelled or panicked.
///
/// Dropping the handle *abandons* the task: unless [`detach`] was called
/// first, cancellation is requested with [`CancellationReason::Abandoned`]
/// and the task unwinds at its next cancellation point. The drop itself
/// never blocks.
///
/// [`detach`]: TaskHandle::detach
pub struct TaskHandle<T> {
    context: Arc<TaskContext>,
    result: Arc<ResultSlot<T>>,
    waiter_key: u64,
    detached: bool,
}

impl<T: Send> TaskHandle<T> {
    pub(crate) fn new(context: Arc<TaskContext>, result: Arc<ResultSlot<T>>) -> Self {
        TaskHandle {
            context,
            result,
            waiter_key: next_waiter_key(),
            detached: false,
        }
    }

    /// The identifier of the task behind this handle.
    pub fn id(&self) -> Id {
        self.context.id()
    }

    pub fn state(&self) -> ExecutionState {
        self.context.state()
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    /// Requests cancellation of the task with
    /// [`CancellationReason::UserRequest`]. The task keeps running until its
    /// next cancellation point.
    pub fn cancel(&self) {
        self.context.request_cancel(CancellationReason::UserRequest);
    }

    /// A token for requesting and observing cancellation without holding the
    /// result.
    pub fn cancellation_token(&self) -> CancellationToken {
        CancellationToken::new(self.context.clone())
    }

    /// Lets the task run to completion on its own; dropping the handle will
    /// no longer request cancellation. The processor keeps the task alive.
    pub fn detach(mut self) {
        self.detached = true;
        self.context.processor().detach(self.context.clone());
    }

    /// Suspends the current task until the target finishes or `deadline`
    /// passes.
    ///
    /// # Panics
    ///
    /// Panics when called on the handle of the current task, or from outside
    /// a task.
    pub async fn wait_until(&self, deadline: Deadline) -> WaitStatus {
        assert!(
            !self.context.is_current(),
            "a task may not wait for itself"
        );
        match self.context.finish_waiters().wait_until(deadline).await {
            WakeupSource::WaitList => WaitStatus::Ready,
            WakeupSource::DeadlineTimer => WaitStatus::Timeout,
            WakeupSource::CancelRequest => WaitStatus::Cancelled,
            source => unreachable!("wait for task completion woken by {source:?}"),
        }
    }

    /// Blocks the current *thread* until the task finishes. For use outside
    /// any task, e.g. when driving the engine from synchronous code.
    ///
    /// # Panics
    ///
    /// Panics when called from inside a task; suspend with
    /// [`wait_until`](TaskHandle::wait_until) there instead.
    pub fn wait(&self) {
        assert!(
            context::try_current_task().is_none(),
            "blocking wait called from inside a task"
        );
        let unparker = Arc::new(ThreadUnparker {
            thread: thread::current(),
            notified: AtomicBool::new(false),
        });
        let waker = futures::task::waker(unparker.clone());
        let key = next_waiter_key();
        while !self
            .context
            .finish_waiters()
            .get_signal_or_append(key, &waker)
        {
            unparker.park_until_notified();
        }
    }

    /// Blocks the current thread until the task finishes, then returns its
    /// result. See [`wait`](TaskHandle::wait) for the threading caveats.
    pub fn get_blocking(self) -> Result<T, TaskError> {
        self.wait();
        self.take_result()
    }

    /// The task's result, if it already finished. Returns `None` while the
    /// task is still running.
    pub fn try_result(&mut self) -> Option<Result<T, TaskError>> {
        if !self.context.is_finished() {
            return None;
        }
        Some(self.take_result())
    }

    fn take_result(&self) -> Result<T, TaskError> {
        match self.context.state() {
            ExecutionState::Completed => match self.result.take() {
                Some(Ok(value)) => Ok(value),
                Some(Err(panic)) => Err(TaskError::Panicked(panic)),
                None => panic!("task result was already taken"),
            },
            ExecutionState::Cancelled => Err(TaskError::Cancelled(
                self.context
                    .cancellation_reason()
                    .unwrap_or(CancellationReason::UserRequest),
            )),
            state => unreachable!("taking the result of a task in state {state:?}"),
        }
    }
}

impl<T> Unpin for TaskHandle<T> {}

impl<T: Send> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        assert!(
            !this.context.is_current(),
            "a task may not await its own handle"
        );
        if !this.context.is_finished()
            && !this
                .context
                .finish_waiters()
                .get_signal_or_append(this.waiter_key, cx.waker())
        {
            return Poll::Pending;
        }
        Poll::Ready(this.take_result())
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.detached && !self.context.is_finished() {
            self.context.request_cancel(CancellationReason::Abandoned);
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.context.id())
            .field("state", &self.context.state())
            .finish()
    }
}

struct ThreadUnparker {
    thread: Thread,
    notified: AtomicBool,
}

impl ThreadUnparker {
    fn park_until_notified(&self) {
        while !self.notified.swap(false, Ordering::AcqRel) {
            thread::park();
        }
    }
}

impl futures::task::ArcWake for ThreadUnparker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.notified.store(true, Ordering::Release);
        arc_self.thread.unpark();
    }
}

/// A cloneable handle to a task whose result every holder can read.
///
/// The task is kept cancellable-on-abandon collectively: only when the last
/// clone is dropped (and the task has not finished) is cancellation with
/// [`CancellationReason::Abandoned`] requested.
pub struct SharedTaskHandle<T> {
    context: Arc<TaskContext>,
    result: Arc<ResultSlot<T>>,
    shared: Arc<OnceLock<Result<T, SharedTaskError>>>,
}

impl<T> SharedTaskHandle<T>
where
    T: Clone + Send,
{
    pub(crate) fn new(context: Arc<TaskContext>, result: Arc<ResultSlot<T>>) -> Self {
        context.increment_shared_usages();
        SharedTaskHandle {
            context,
            result,
            shared: Arc::new(OnceLock::new()),
        }
    }

    pub fn id(&self) -> Id {
        self.context.id()
    }

    pub fn state(&self) -> ExecutionState {
        self.context.state()
    }

    pub fn is_finished(&self) -> bool {
        self.context.is_finished()
    }

    pub fn cancel(&self) {
        self.context.request_cancel(CancellationReason::UserRequest);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        CancellationToken::new(self.context.clone())
    }

    /// See [`TaskHandle::wait_until`].
    pub async fn wait_until(&self, deadline: Deadline) -> WaitStatus {
        assert!(
            !self.context.is_current(),
            "a task may not wait for itself"
        );
        match self.context.finish_waiters().wait_until(deadline).await {
            WakeupSource::WaitList => WaitStatus::Ready,
            WakeupSource::DeadlineTimer => WaitStatus::Timeout,
            WakeupSource::CancelRequest => WaitStatus::Cancelled,
            source => unreachable!("wait for task completion woken by {source:?}"),
        }
    }

    /// A clone of the task's result, if it already finished. Every clone of
    /// the handle observes the same result.
    pub fn try_get(&self) -> Option<Result<T, SharedTaskError>> {
        if !self.context.is_finished() {
            return None;
        }
        let result = self.shared.get_or_init(|| match self.context.state() {
            ExecutionState::Completed => match self.result.take() {
                Some(Ok(value)) => Ok(value),
                Some(Err(_panic)) => Err(SharedTaskError::Panicked),
                None => unreachable!("completed task with no stored result"),
            },
            ExecutionState::Cancelled => Err(SharedTaskError::Cancelled(
                self.context
                    .cancellation_reason()
                    .unwrap_or(CancellationReason::UserRequest),
            )),
            state => unreachable!("taking the result of a task in state {state:?}"),
        });
        Some(result.clone())
    }
}

impl<T> Clone for SharedTaskHandle<T> {
    fn clone(&self) -> Self {
        self.context.increment_shared_usages();
        SharedTaskHandle {
            context: self.context.clone(),
            result: self.result.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> Drop for SharedTaskHandle<T> {
    fn drop(&mut self) {
        if self.context.decrement_shared_usages() == 0 && !self.context.is_finished() {
            self.context.request_cancel(CancellationReason::Abandoned);
        }
    }
}

impl<T> fmt::Debug for SharedTaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTaskHandle")
            .field("id", &self.context.id())
            .field("state", &self.context.state())
            .finish()
    }
}
