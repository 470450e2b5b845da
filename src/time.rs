//! Suspending the current task for a duration, and yielding the processor.

use crate::cancel::CancellationBlocker;
use crate::deadline::Deadline;
use crate::task::wakeup::WakeupSource;
use crate::wait::{CommonWaitStrategy, suspend};
use std::time::Duration;

/// Suspends the current task until `deadline`.
///
/// The sleep can be cut short by a cancellation request; the returned source
/// tells which one happened. Use [`sleep_until`] when the full duration must
/// pass regardless of cancellation.
pub async fn interruptible_sleep_until(deadline: Deadline) -> WakeupSource {
    let mut strategy = CommonWaitStrategy;
    suspend(&mut strategy, deadline).await
}

/// Suspends the current task until `deadline`, ignoring cancellation requests
/// for the duration of the sleep.
///
/// A pending cancellation is honored again at the next cancellation point
/// after the sleep.
pub async fn sleep_until(deadline: Deadline) {
    let _blocker = CancellationBlocker::new();
    interruptible_sleep_until(deadline).await;
}

/// Suspends the current task for `duration`. See [`sleep_until`].
pub async fn sleep_for(duration: Duration) {
    sleep_until(Deadline::from_duration(duration)).await;
}

/// Reschedules the current task to the back of the run queue, giving other
/// queued tasks a chance to run.
///
/// Implemented as a sleep with an already-passed deadline: the task suspends
/// for exactly one scheduling round trip.
pub async fn yield_now() {
    interruptible_sleep_until(Deadline::passed()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancellationReason, checkpoint};
    use crate::task::state::ExecutionState;
    use crate::test_utils::{DummyProcessor, step_task, test_task};

    #[test]
    fn yield_requeues_the_task_once_per_round() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {
            for _ in 0..3 {
                yield_now().await;
            }
        });

        let mut steps = 0;
        while task.state() != ExecutionState::Completed {
            step_task(&task);
            steps += 1;
            assert!(steps <= 8, "task never completed");
        }
        // One step per yield round trip plus the final one.
        assert_eq!(steps, 4);
    }

    #[test]
    fn cancel_interrupts_an_interruptible_sleep() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {
            let source = interruptible_sleep_until(Deadline::unreachable()).await;
            assert_eq!(source, WakeupSource::CancelRequest);
            checkpoint().await;
        });

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Suspended);

        task.request_cancel(CancellationReason::UserRequest);
        assert_eq!(task.state(), ExecutionState::Queued);

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Cancelled);
    }

    #[test]
    fn blocked_cancellation_does_not_cut_the_sleep_short() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {
            let _blocker = CancellationBlocker::new();
            let source = interruptible_sleep_until(Deadline::passed()).await;
            assert_eq!(source, WakeupSource::DeadlineTimer);
        });

        step_task(&task);
        task.request_cancel(CancellationReason::UserRequest);

        // The passed deadline already requeued the task; the cancellation
        // request could not.
        assert_eq!(task.state(), ExecutionState::Queued);
        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);
    }

    #[test]
    fn pending_cancel_makes_sleeps_immediate() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {
            yield_now().await;
            let source = interruptible_sleep_until(Deadline::unreachable()).await;
            assert_eq!(source, WakeupSource::CancelRequest);
            let source = interruptible_sleep_until(Deadline::unreachable()).await;
            assert_eq!(source, WakeupSource::CancelRequest);
        });

        step_task(&task);
        task.request_cancel(CancellationReason::UserRequest);
        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);
    }
}
