//! Suspension protocol: wait strategies and the [`suspend`] future.
//!
//! Every way a task can sleep funnels through [`suspend`]. The caller
//! describes *what* it waits for with a [`WaitStrategy`]; the future drives
//! the sleep-state handshake on the current task and resolves to the
//! [`WakeupSource`] that ended the sleep.

use crate::context;
use crate::deadline::Deadline;
use crate::task::{Epoch, Id, WakeupSource};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Whether a wakeup condition was already satisfied while wakeups were being
/// set up, making the suspension unnecessary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyWakeup(pub bool);

/// Hooks a suspension into a wakeup source.
///
/// `setup_wakeups` runs on the sleeping task's thread right before it
/// suspends and must register whatever will later call
/// [`TaskContext::wakeup`] / [`TaskContext::wakeup_no_epoch`] on the task.
///
/// [`TaskContext::wakeup`]: crate::task::TaskContext::wakeup
/// [`TaskContext::wakeup_no_epoch`]: crate::task::TaskContext::wakeup_no_epoch
/// `disable_wakeups` runs right after a suspension ends (normally or by the
/// in-flight [`Suspend`] future being dropped) and must undo the
/// registration. When `setup_wakeups` reports an early wakeup the suspension
/// is skipped and `disable_wakeups` is not called, so the strategy must not
/// leave a registration behind on that path.
pub trait WaitStrategy {
    /// Registers external wakeup sources. Returning `EarlyWakeup(true)`
    /// aborts the suspension before the task ever leaves the running state.
    fn setup_wakeups(&mut self) -> EarlyWakeup;

    /// Unregisters whatever `setup_wakeups` registered.
    fn disable_wakeups(&mut self);
}

/// Strategy with no external wakeup source. The sleep ends only through the
/// deadline timer or a cancellation request.
#[derive(Debug, Default)]
pub struct CommonWaitStrategy;

impl WaitStrategy for CommonWaitStrategy {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {}
}

/// Suspends the current task until a wakeup arrives or `deadline` passes.
///
/// Cancellation requests interrupt the sleep unless the task is currently
/// non-cancellable. The resolved [`WakeupSource`] tells the caller which
/// producer ended the sleep; [`WakeupSource::has_wait_succeeded`] folds it
/// into success/failure.
///
/// The returned future is cancel-safe: dropping it mid-sleep unregisters the
/// strategy and leaves the task's sleep machinery consistent.
pub fn suspend<W: WaitStrategy>(strategy: &mut W, deadline: Deadline) -> Suspend<'_, W> {
    Suspend {
        strategy,
        deadline,
        phase: Phase::Initial,
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Initial,
    Suspended {
        owner: Id,
        sleep_epoch: Epoch,
        deadline_armed: bool,
    },
    Finished,
}

pub struct Suspend<'a, W: WaitStrategy> {
    strategy: &'a mut W,
    deadline: Deadline,
    phase: Phase,
}

impl<W: WaitStrategy> Future for Suspend<'_, W> {
    type Output = WakeupSource;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<WakeupSource> {
        // Fields are never structurally pinned; the strategy lives outside
        // the future and the rest is Unpin.
        let this = unsafe { self.get_unchecked_mut() };
        let task = context::current_task();

        match this.phase {
            Phase::Initial => match task.prepare_sleep(this.strategy, this.deadline) {
                SleepOutcome::Immediate(source) => {
                    this.phase = Phase::Finished;
                    Poll::Ready(source)
                }
                SleepOutcome::Suspended {
                    sleep_epoch,
                    deadline_armed,
                } => {
                    this.phase = Phase::Suspended {
                        owner: task.id(),
                        sleep_epoch,
                        deadline_armed,
                    };
                    Poll::Pending
                }
            },
            Phase::Suspended {
                sleep_epoch,
                deadline_armed,
                ..
            } => {
                let source = task.finish_sleep(this.strategy, sleep_epoch, deadline_armed);
                this.phase = Phase::Finished;
                Poll::Ready(source)
            }
            Phase::Finished => panic!("suspend future polled after completion"),
        }
    }
}

impl<W: WaitStrategy> Drop for Suspend<'_, W> {
    fn drop(&mut self) {
        let Phase::Suspended {
            owner,
            sleep_epoch,
            deadline_armed,
        } = self.phase
        else {
            return;
        };
        // The future is being dropped between its two poll phases: an
        // enclosing future abandoned us mid-sleep. Unregister the strategy
        // and retire the interrupted sleep cycle so stale wakeups cannot
        // reschedule the task. When the drop happens outside the owning
        // task's slice (payload teardown), the cycle dies with the task.
        self.strategy.disable_wakeups();
        if let Some(task) = context::try_current_task() {
            if task.id() == owner {
                task.abandon_sleep(sleep_epoch, deadline_armed);
            }
        }
    }
}

/// Outcome of [`prepare_sleep`](crate::task::TaskContext::prepare_sleep).
pub(crate) enum SleepOutcome {
    /// The wait was satisfied (or overridden) without leaving the running
    /// state.
    Immediate(WakeupSource),
    /// The task committed to sleeping and must complete the handshake via
    /// [`finish_sleep`](crate::task::TaskContext::finish_sleep) on its next
    /// execution slice.
    Suspended {
        sleep_epoch: Epoch,
        deadline_armed: bool,
    },
}
