use crate::task::sleep_state::SleepFlags;

/// The classified cause a sleeping task resumed.
///
/// When several producers fire during one sleep cycle, exactly one source is
/// resolved as primary, by strict priority: `WaitList` > `DeadlineTimer` >
/// `Bootstrap` > `CancelRequest`. A cancellation wakeup is honored as primary
/// only while the task is cancellable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WakeupSource {
    /// No wakeup resolved yet; never returned from a completed sleep.
    None,
    /// A wait list (or any other structural signal) woke the task. May be
    /// spurious; callers re-check their own condition.
    WaitList,
    /// The per-sleep deadline elapsed.
    DeadlineTimer,
    /// A cancellation request was observed.
    CancelRequest,
    /// First-ever scheduling of a freshly spawned task.
    Bootstrap,
}

impl WakeupSource {
    pub(crate) fn flag(self) -> SleepFlags {
        match self {
            WakeupSource::None => SleepFlags::empty(),
            WakeupSource::WaitList => SleepFlags::WAKEUP_BY_WAIT_LIST,
            WakeupSource::DeadlineTimer => SleepFlags::WAKEUP_BY_DEADLINE_TIMER,
            WakeupSource::CancelRequest => SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
            WakeupSource::Bootstrap => SleepFlags::WAKEUP_BY_BOOTSTRAP,
        }
    }

    /// Whether a wait that resumed with this source found what it waited for.
    ///
    /// Only meaningful for sources a finished wait can resolve to; `None` and
    /// `Bootstrap` are programming errors here.
    pub fn has_wait_succeeded(self) -> bool {
        match self {
            WakeupSource::WaitList => true,
            WakeupSource::DeadlineTimer | WakeupSource::CancelRequest => false,
            WakeupSource::None | WakeupSource::Bootstrap => {
                panic!("invalid wakeup source for a finished wait: {self:?}")
            }
        }
    }
}

/// Why an execution slice handed control back to the step loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum YieldReason {
    None,
    /// The payload suspended on a wait.
    Waiting,
    /// The payload observed cancellation (or was shed before starting).
    Cancelled,
    /// The payload ran to completion (including a stored panic).
    Complete,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::wait_list(WakeupSource::WaitList, true)]
    #[case::deadline(WakeupSource::DeadlineTimer, false)]
    #[case::cancel(WakeupSource::CancelRequest, false)]
    fn wait_success(#[case] source: WakeupSource, #[case] succeeded: bool) {
        assert_eq!(source.has_wait_succeeded(), succeeded);
    }

    #[rstest]
    #[case::none(WakeupSource::None)]
    #[case::bootstrap(WakeupSource::Bootstrap)]
    #[should_panic(expected = "invalid wakeup source")]
    fn wait_success_rejects_non_wait_sources(#[case] source: WakeupSource) {
        let _ = source.has_wait_succeeded();
    }

    #[test]
    fn flags_match_sources() {
        assert_eq!(
            WakeupSource::WaitList.flag() | WakeupSource::DeadlineTimer.flag()
                | WakeupSource::CancelRequest.flag()
                | WakeupSource::Bootstrap.flag(),
            SleepFlags::WAKEUP_ANY
        );
        assert!(WakeupSource::None.flag().is_empty());
    }
}
