use std::sync::atomic::{AtomicU8, Ordering};

/// Scheduler-visible lifecycle state of a task.
///
/// `New → Queued → Running` once, then `Running → Suspended → Queued →
/// Running` any number of times, until a terminal `Completed` or `Cancelled`.
/// Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecutionState {
    /// Constructed, never scheduled.
    New = 0,
    /// In the task processor's run queue.
    Queued = 1,
    /// An execution slice is in flight on some worker.
    Running = 2,
    /// Asleep, waiting for a wakeup.
    Suspended = 3,
    /// Finished; the result (or stored failure) is available.
    Completed = 4,
    /// Finished without producing a result.
    Cancelled = 5,
}

impl ExecutionState {
    pub fn is_finished(self) -> bool {
        matches!(self, ExecutionState::Completed | ExecutionState::Cancelled)
    }

    fn from_u8(value: u8) -> ExecutionState {
        match value {
            0 => ExecutionState::New,
            1 => ExecutionState::Queued,
            2 => ExecutionState::Running,
            3 => ExecutionState::Suspended,
            4 => ExecutionState::Completed,
            5 => ExecutionState::Cancelled,
            _ => unreachable!("corrupt execution state: {value}"),
        }
    }

    /// Valid edges of the lifecycle graph. `Queued → Cancelled` covers a task
    /// denied an execution permit before its first slice.
    fn may_become(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (New, Queued)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Suspended)
                | (Running, Completed)
                | (Running, Cancelled)
                | (Suspended, Queued)
        )
    }
}

pub(crate) struct AtomicExecutionState(AtomicU8);

impl AtomicExecutionState {
    pub(crate) fn new() -> Self {
        AtomicExecutionState(AtomicU8::new(ExecutionState::New as u8))
    }

    pub(crate) fn load(&self, order: Ordering) -> ExecutionState {
        ExecutionState::from_u8(self.0.load(order))
    }

    pub(crate) fn set(&self, next: ExecutionState) {
        let prev = ExecutionState::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        debug_assert!(
            prev.may_become(next),
            "invalid execution state transition {prev:?} -> {next:?}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::new_state(ExecutionState::New, false)]
    #[case::queued(ExecutionState::Queued, false)]
    #[case::running(ExecutionState::Running, false)]
    #[case::suspended(ExecutionState::Suspended, false)]
    #[case::completed(ExecutionState::Completed, true)]
    #[case::cancelled(ExecutionState::Cancelled, true)]
    fn terminal_states(#[case] state: ExecutionState, #[case] finished: bool) {
        assert_eq!(state.is_finished(), finished);
    }

    #[test]
    fn lifecycle_roundtrip() {
        let state = AtomicExecutionState::new();
        assert_eq!(state.load(Ordering::Acquire), ExecutionState::New);

        for next in [
            ExecutionState::Queued,
            ExecutionState::Running,
            ExecutionState::Suspended,
            ExecutionState::Queued,
            ExecutionState::Running,
            ExecutionState::Completed,
        ] {
            state.set(next);
            assert_eq!(state.load(Ordering::Acquire), next);
        }
    }

    #[test]
    #[should_panic(expected = "invalid execution state transition")]
    #[cfg(debug_assertions)]
    fn terminal_is_sticky() {
        let state = AtomicExecutionState::new();
        state.set(ExecutionState::Queued);
        state.set(ExecutionState::Cancelled);
        state.set(ExecutionState::Queued);
    }
}
