//! The per-task control block.
//!
//! [`TaskContext`] carries everything the engine needs to suspend, resume and
//! cancel one task: the packed sleep word, the execution state, the recorded
//! cancellation reason and the task's payload. The sleep word is the heart of
//! it; see [`sleep_state`](crate::task::sleep_state) for the packing and the
//! epoch scheme. Everything here is written against two rules:
//!
//!  * a task is scheduled exactly once per sleep cycle, no matter how many
//!    wakeup producers fire;
//!  * a wakeup arriving while the task still runs is never lost, it is
//!    consumed when the task next tries to sleep.

use crate::cancel::{CancellationReason, ReasonSlot};
use crate::context::{self, CurrentTaskScope};
use crate::deadline::Deadline;
use crate::processor::{CoroutineSlot, TaskProcessor};
use crate::task::payload::Payload;
use crate::task::sleep_state::{AtomicSleepState, SleepFlags, SleepState};
use crate::task::state::{AtomicExecutionState, ExecutionState};
use crate::task::waker::waker_ref;
use crate::task::wakeup::{WakeupSource, YieldReason};
use crate::task::{Epoch, Id};
use crate::timer::{TimerHandle, TimerService};
use crate::wait::{EarlyWakeup, SleepOutcome, WaitStrategy};
use crate::wait_list::WaitList;
use parking_lot::Mutex;
use std::cell::Cell;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

pub struct TaskContext {
    id: Id,
    processor: Arc<dyn TaskProcessor>,
    timers: Arc<dyn TimerService>,
    was_started_as_critical: bool,

    execution_state: AtomicExecutionState,
    sleep_state: AtomicSleepState,
    cancellation_reason: ReasonSlot,
    shared_usages: AtomicUsize,
    finish_waiters: WaitList,

    payload: Mutex<Option<Pin<Box<dyn Payload>>>>,
    coroutine: Mutex<Option<CoroutineSlot>>,
    deadline_timer: Mutex<Option<TimerHandle>>,

    self_ref: Weak<TaskContext>,

    // Owned by the task itself: only the thread currently executing the
    // task's slice may touch these, and slices are handed between worker
    // threads through the scheduler queue, which synchronizes.
    is_cancellable: Cell<bool>,
    within_sleep: Cell<bool>,
    yield_reason: Cell<YieldReason>,
    cancel_deadline: Cell<Deadline>,
}

// The Cell fields follow the single-slice protocol above; every other field
// is atomic or lock-protected.
unsafe impl Send for TaskContext {}
unsafe impl Sync for TaskContext {}

impl TaskContext {
    pub(crate) fn new(
        processor: Arc<dyn TaskProcessor>,
        critical: bool,
        cancel_deadline: Deadline,
        payload: Pin<Box<dyn Payload>>,
    ) -> Arc<TaskContext> {
        let timers = processor.timer_service();
        Arc::new_cyclic(|self_ref| TaskContext {
            id: Id::next(),
            processor,
            timers,
            was_started_as_critical: critical,
            execution_state: AtomicExecutionState::new(),
            // The task is born inside a bootstrap sleep; `start` is the
            // wakeup that ends it.
            sleep_state: AtomicSleepState::new(SleepState::new(SleepFlags::SLEEPING, Epoch(0))),
            cancellation_reason: ReasonSlot::new(),
            shared_usages: AtomicUsize::new(0),
            finish_waiters: WaitList::new(),
            payload: Mutex::new(Some(payload)),
            coroutine: Mutex::new(None),
            deadline_timer: Mutex::new(None),
            self_ref: self_ref.clone(),
            is_cancellable: Cell::new(true),
            within_sleep: Cell::new(false),
            yield_reason: Cell::new(YieldReason::None),
            cancel_deadline: Cell::new(cancel_deadline),
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn state(&self) -> ExecutionState {
        self.execution_state.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Whether the task is currently executing on this thread.
    pub fn is_current(&self) -> bool {
        context::current_task_id() == Some(self.id)
    }

    /// Critical tasks run their payload at least once even under overload
    /// or pre-start cancellation. A task that already holds a coroutine is
    /// critical for the rest of its life.
    pub fn is_critical(&self) -> bool {
        self.was_started_as_critical || self.has_coroutine()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason.get().is_some()
    }

    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.cancellation_reason.get()
    }

    /// Whether the task should act on a pending cancellation request. Only
    /// meaningful on the task's own thread.
    pub fn should_cancel(&self) -> bool {
        self.is_cancel_requested() && self.is_cancellable.get()
    }

    pub(crate) fn processor(&self) -> &Arc<dyn TaskProcessor> {
        &self.processor
    }

    pub(crate) fn finish_waiters(&self) -> &WaitList {
        &self.finish_waiters
    }

    pub(crate) fn epoch(&self) -> Epoch {
        self.sleep_state.load(Ordering::Acquire).epoch
    }

    fn has_coroutine(&self) -> bool {
        self.coroutine.lock().is_some()
    }

    fn arc(&self) -> Arc<TaskContext> {
        self.self_ref
            .upgrade()
            .expect("task context used after the last reference was dropped")
    }

    /// Requests cancellation. The first recorded reason wins; the task is
    /// woken if it sleeps cancellably. Returns whether this call recorded
    /// the reason.
    pub fn request_cancel(&self, reason: CancellationReason) -> bool {
        if self.is_finished() {
            return false;
        }
        if !self.cancellation_reason.try_set(reason) {
            return false;
        }
        tracing::debug!(task = self.id.as_u64(), %reason, "cancellation requested");
        self.wakeup(WakeupSource::CancelRequest, self.epoch());
        true
    }

    /// Toggles whether the task honors cancellation requests. Returns the
    /// previous value. Must be called by the task itself while running.
    pub(crate) fn set_cancellable(&self, value: bool) -> bool {
        debug_assert!(self.is_current());
        debug_assert_eq!(self.state(), ExecutionState::Running);
        self.is_cancellable.replace(value)
    }

    /// Moves the task's cancellation deadline and re-arms the cancellation
    /// timer. Must be called by the task itself while running.
    pub fn set_cancel_deadline(&self, deadline: Deadline) {
        debug_assert!(self.is_current());
        debug_assert_eq!(self.state(), ExecutionState::Running);
        self.cancel_deadline.set(deadline);
        self.arm_cancellation_timer();
    }

    /// Marks the current execution slice as unwinding due to cancellation.
    /// The slice's `Pending` return then destroys the payload instead of
    /// suspending the task.
    pub(crate) fn begin_cancellation_unwind(&self) {
        debug_assert!(self.is_current());
        self.yield_reason.set(YieldReason::Cancelled);
    }

    pub(crate) fn increment_shared_usages(&self) {
        self.shared_usages.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the usage count after the decrement.
    pub(crate) fn decrement_shared_usages(&self) -> usize {
        let prev = self.shared_usages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        prev - 1
    }

    /// The bootstrap wakeup: schedules the task for its first step.
    pub(crate) fn start(&self) {
        self.wakeup(WakeupSource::Bootstrap, Epoch(0));
    }

    /// Epoch-checked wakeup for producers bound to one sleep cycle: the
    /// deadline timer, cancellation requests and bootstrap. A mismatched
    /// epoch means the cycle is over and the wakeup dissolves.
    pub(crate) fn wakeup(&self, source: WakeupSource, epoch: Epoch) {
        debug_assert!(!matches!(
            source,
            WakeupSource::None | WakeupSource::WaitList
        ));
        if self.is_finished() {
            return;
        }
        let mut current = self.sleep_state.load(Ordering::Relaxed);
        loop {
            if current.epoch != epoch {
                return;
            }
            if source == WakeupSource::CancelRequest
                && current.flags.contains(SleepFlags::NON_CANCELLABLE)
            {
                return;
            }
            let desired = SleepState::new(current.flags | source.flag(), current.epoch);
            match self.sleep_state.compare_exchange_weak(
                current,
                desired,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(prev) => {
                    if should_schedule(prev.flags, source) {
                        self.schedule();
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Epoch-free wakeup for wait-list producers. Wakers outlive sleep
    /// cycles, so a late wake may be spurious; sleepers on wait lists must
    /// tolerate that and re-check their condition.
    pub(crate) fn wakeup_no_epoch(&self, source: WakeupSource) {
        debug_assert_eq!(source, WakeupSource::WaitList);
        if self.is_finished() {
            return;
        }
        let prev = self.sleep_state.fetch_or_flags(source.flag(), Ordering::SeqCst);
        if should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    fn schedule(&self) {
        self.execution_state.set(ExecutionState::Queued);
        self.processor.schedule(self.arc());
    }

    /// First half of a suspension, run by the [`suspend`](crate::wait::suspend)
    /// future on its first poll.
    pub(crate) fn prepare_sleep(
        &self,
        strategy: &mut dyn WaitStrategy,
        deadline: Deadline,
    ) -> SleepOutcome {
        debug_assert!(self.is_current());
        debug_assert_eq!(self.state(), ExecutionState::Running);
        debug_assert!(
            !self.within_sleep.get(),
            "a task may not hold two suspensions in flight"
        );

        // A pending cancellation overrides the wait before it starts.
        if self.should_cancel() {
            return SleepOutcome::Immediate(WakeupSource::CancelRequest);
        }

        self.within_sleep.set(true);
        let sleep_epoch = self.sleep_state.load(Ordering::SeqCst).epoch;

        if strategy.setup_wakeups() == EarlyWakeup(true) {
            // The wait condition already holds; retire the cycle without
            // suspending so queued producers for it dissolve.
            self.sleep_state.store(
                SleepState::new(SleepFlags::empty(), sleep_epoch.next()),
                Ordering::Release,
            );
            self.within_sleep.set(false);
            return SleepOutcome::Immediate(WakeupSource::WaitList);
        }

        let has_deadline = deadline.is_reachable()
            && (!self.is_cancellable.get() || deadline < self.cancel_deadline.get());
        if has_deadline {
            self.arm_deadline_timer(deadline, sleep_epoch);
        }
        SleepOutcome::Suspended {
            sleep_epoch,
            deadline_armed: has_deadline,
        }
    }

    /// Second half of a suspension, run on the first poll after resumption.
    /// Consumes the wakeup flags and reports the primary source that ended
    /// the sleep.
    pub(crate) fn finish_sleep(
        &self,
        strategy: &mut dyn WaitStrategy,
        sleep_epoch: Epoch,
        deadline_armed: bool,
    ) -> WakeupSource {
        debug_assert!(self.is_current());
        debug_assert!(self.within_sleep.get());

        if deadline_armed {
            // The slot held the sleep's wakeup timer; hand it back to the
            // cancellation deadline.
            self.arm_cancellation_timer();
        }
        strategy.disable_wakeups();

        let prev = self.sleep_state.exchange(
            SleepState::new(SleepFlags::empty(), sleep_epoch.next()),
            Ordering::AcqRel,
        );
        self.within_sleep.set(false);
        primary_wakeup_source(prev.flags)
    }

    /// Tears down a suspension whose future was dropped between its two
    /// polls. The cycle is retired exactly as `finish_sleep` would, minus
    /// the wakeup-source report.
    pub(crate) fn abandon_sleep(&self, sleep_epoch: Epoch, deadline_armed: bool) {
        debug_assert!(self.is_current());
        debug_assert!(self.within_sleep.get());

        if deadline_armed {
            self.arm_cancellation_timer();
        }
        self.sleep_state.exchange(
            SleepState::new(SleepFlags::empty(), sleep_epoch.next()),
            Ordering::AcqRel,
        );
        self.within_sleep.set(false);
    }

    fn arm_deadline_timer(&self, deadline: Deadline, sleep_epoch: Epoch) {
        if deadline.is_reached() {
            // No round trip through the timer thread for a deadline that
            // already passed; the flag lands via the raced-wakeup path.
            self.wakeup(WakeupSource::DeadlineTimer, sleep_epoch);
            return;
        }
        let handle = self.timers.arm_wakeup(self.arc(), deadline, sleep_epoch);
        *self.deadline_timer.lock() = Some(handle);
    }

    fn arm_cancellation_timer(&self) {
        let cancel_deadline = self.cancel_deadline.get();
        if self.is_cancel_requested() || !cancel_deadline.is_reachable() {
            self.deadline_timer.lock().take();
            return;
        }
        if cancel_deadline.is_reached() {
            self.deadline_timer.lock().take();
            self.request_cancel(CancellationReason::Deadline);
            return;
        }
        let handle = self.timers.arm_cancel(self.arc(), cancel_deadline);
        *self.deadline_timer.lock() = Some(handle);
    }

    /// Runs one execution slice of the task. Called by the processor with
    /// the task in the queued state.
    pub(crate) fn do_step(&self) {
        if self.is_finished() {
            return;
        }

        let first_step = !self.has_coroutine();
        if first_step {
            match self.processor.acquire_coroutine() {
                Some(slot) => *self.coroutine.lock() = Some(slot),
                None => {
                    tracing::warn!(
                        task = self.id.as_u64(),
                        "coroutine pool exhausted, cancelling task"
                    );
                    self.cancellation_reason
                        .try_set(CancellationReason::OutOfMemory);
                    self.payload.lock().take();
                    self.finish(ExecutionState::Cancelled);
                    return;
                }
            }
            self.arm_cancellation_timer();
            self.sleep_state.clear_flags(
                SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_BOOTSTRAP,
                Ordering::Relaxed,
            );
        } else if self.within_sleep.get() {
            // Resuming into `finish_sleep`, which consumes the wakeup flags
            // itself; only leave the sleeping state.
            self.sleep_state
                .clear_flags(SleepFlags::SLEEPING, Ordering::Relaxed);
        } else {
            // The previous slice suspended on a foreign future, outside the
            // sleep protocol. Nothing will consume that cycle, so retire it
            // wholesale.
            let current = self.sleep_state.load(Ordering::Relaxed);
            self.sleep_state
                .exchange(current.next_epoch(), Ordering::AcqRel);
        }

        let yield_reason = {
            let _scope = CurrentTaskScope::enter(self.arc());
            self.execution_state.set(ExecutionState::Running);
            self.run_slice(first_step)
        };

        match yield_reason {
            YieldReason::Complete => {
                self.coroutine.lock().take();
                self.finish(ExecutionState::Completed);
            }
            YieldReason::Cancelled => {
                self.coroutine.lock().take();
                self.finish(ExecutionState::Cancelled);
            }
            YieldReason::Waiting => {
                self.execution_state.set(ExecutionState::Suspended);

                let mut new_flags = SleepFlags::SLEEPING;
                if !self.is_cancellable.get() {
                    new_flags |= SleepFlags::NON_CANCELLABLE;
                }
                let prev = self.sleep_state.fetch_or_flags(new_flags, Ordering::SeqCst);
                debug_assert!(!prev.flags.contains(SleepFlags::SLEEPING));

                // Wakeups that raced the suspension are already recorded in
                // the word; turn them into the one allowed schedule.
                let mut raced = prev.flags;
                raced.remove(SleepFlags::NON_CANCELLABLE);
                if new_flags.contains(SleepFlags::NON_CANCELLABLE) {
                    raced.remove(SleepFlags::WAKEUP_BY_CANCEL_REQUEST);
                }
                if !raced.is_empty() {
                    self.schedule();
                }
            }
            YieldReason::None => unreachable!("execution slice ended without a yield reason"),
        }
    }

    fn run_slice(&self, first_step: bool) -> YieldReason {
        let mut payload_slot = self.payload.lock();
        let Some(payload) = payload_slot.as_mut() else {
            unreachable!("stepping a task with no payload")
        };

        if first_step && self.is_cancel_requested() && !self.was_started_as_critical {
            // Cancelled before it ever ran: the payload is not started.
            payload_slot.take();
            return YieldReason::Cancelled;
        }

        self.yield_reason.set(YieldReason::None);
        let task = self.arc();
        let waker = waker_ref(&task);
        let mut cx = Context::from_waker(&waker);
        match payload.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                payload_slot.take();
                YieldReason::Complete
            }
            Poll::Pending => {
                if self.yield_reason.get() == YieldReason::Cancelled {
                    // Cancellation unwind: destroying the payload runs the
                    // destructors of everything the task held.
                    payload_slot.take();
                    YieldReason::Cancelled
                } else {
                    YieldReason::Waiting
                }
            }
        }
    }

    fn finish(&self, terminal: ExecutionState) {
        debug_assert!(terminal.is_finished());
        debug_assert!(self.payload.lock().is_none());

        self.execution_state.set(terminal);
        self.deadline_timer.lock().take();
        self.finish_waiters.set_signal_and_wakeup_all();
        tracing::debug!(task = self.id.as_u64(), state = ?terminal, "task finished");
        self.processor.release(self);
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        debug_assert_ne!(
            self.state(),
            ExecutionState::Running,
            "a running task lost its last reference"
        );
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cancellation_reason", &self.cancellation_reason.get())
            .finish_non_exhaustive()
    }
}

/// Decides whether the producer that just recorded its wakeup flag also won
/// the right to schedule the task. `prev` is the word as it was before the
/// flag landed.
fn should_schedule(prev: SleepFlags, source: WakeupSource) -> bool {
    if !prev.contains(SleepFlags::SLEEPING) {
        return false;
    }
    match source {
        // Cancellation defers to everyone: it only schedules when the task
        // sleeps cancellably and no other producer beat it to the word.
        WakeupSource::CancelRequest => prev == SleepFlags::SLEEPING,
        // A shutdown sweep can cancel a task between creation and start,
        // consuming the bootstrap cycle first; the bootstrap then defers.
        WakeupSource::Bootstrap => prev == SleepFlags::SLEEPING,
        WakeupSource::WaitList | WakeupSource::DeadlineTimer => {
            let mut prev = prev;
            if prev.contains(SleepFlags::NON_CANCELLABLE) {
                // A recorded-but-masked cancellation must not count as the
                // wakeup that already scheduled the task.
                prev.remove(SleepFlags::NON_CANCELLABLE | SleepFlags::WAKEUP_BY_CANCEL_REQUEST);
            }
            prev == SleepFlags::SLEEPING
        }
        WakeupSource::None => {
            debug_assert!(false, "no wakeup source");
            false
        }
    }
}

/// Ranks the wakeup flags consumed at the end of a sleep: an actual wait
/// success outranks the deadline, which outranks bootstrap; a cancellation
/// request counts only if the sleep was cancellable.
fn primary_wakeup_source(flags: SleepFlags) -> WakeupSource {
    for (flag, source) in [
        (SleepFlags::WAKEUP_BY_WAIT_LIST, WakeupSource::WaitList),
        (SleepFlags::WAKEUP_BY_DEADLINE_TIMER, WakeupSource::DeadlineTimer),
        (SleepFlags::WAKEUP_BY_BOOTSTRAP, WakeupSource::Bootstrap),
    ] {
        if flags.contains(flag) {
            return source;
        }
    }
    if flags.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST)
        && !flags.contains(SleepFlags::NON_CANCELLABLE)
    {
        return WakeupSource::CancelRequest;
    }
    panic!("no valid wakeup source in {flags:?}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationBlocker;
    use crate::test_utils::{DummyProcessor, step_task, test_task, test_task_critical};
    use crate::wait::{CommonWaitStrategy, suspend};
    use static_assertions::assert_impl_all;
    use std::future::Future;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    assert_impl_all!(TaskContext: Send, Sync);

    #[test]
    fn trivial_payload_completes_in_one_step() {
        let processor = DummyProcessor::new();
        let ran = Arc::new(AtomicBool::new(false));
        let (task, _handle) = test_task(&processor, {
            let ran = ran.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
            }
        });

        assert_eq!(task.state(), ExecutionState::New);
        step_task(&task);

        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(task.state(), ExecutionState::Completed);
        assert!(task.finish_waiters().is_signaled());
        assert_eq!(processor.counter().alive(), 0);
    }

    #[test]
    fn start_schedules_exactly_once() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {});

        task.start();
        assert_eq!(processor.schedule_count(), 1);
        assert_eq!(task.state(), ExecutionState::Queued);
    }

    #[test]
    fn pre_start_cancellation_sheds_the_payload() {
        let processor = DummyProcessor::new();
        let polled = Arc::new(AtomicBool::new(false));
        let (task, _handle) = test_task(&processor, {
            let polled = polled.clone();
            async move {
                polled.store(true, Ordering::SeqCst);
            }
        });

        assert!(task.request_cancel(CancellationReason::UserRequest));
        step_task(&task);

        assert!(!polled.load(Ordering::SeqCst));
        assert_eq!(task.state(), ExecutionState::Cancelled);
        assert_eq!(
            task.cancellation_reason(),
            Some(CancellationReason::UserRequest)
        );
    }

    #[test]
    fn critical_task_runs_despite_pre_start_cancellation() {
        let processor = DummyProcessor::new();
        let polled = Arc::new(AtomicBool::new(false));
        let (task, _handle) = test_task_critical(&processor, {
            let polled = polled.clone();
            async move {
                polled.store(true, Ordering::SeqCst);
            }
        });

        task.request_cancel(CancellationReason::UserRequest);
        step_task(&task);

        assert!(polled.load(Ordering::SeqCst));
        assert_eq!(task.state(), ExecutionState::Completed);
    }

    #[test]
    fn exhausted_coroutine_pool_cancels_without_running() {
        let processor = DummyProcessor::with_coroutine_slots(0);
        let polled = Arc::new(AtomicBool::new(false));
        let (task, _handle) = test_task(&processor, {
            let polled = polled.clone();
            async move {
                polled.store(true, Ordering::SeqCst);
            }
        });

        step_task(&task);

        assert!(!polled.load(Ordering::SeqCst));
        assert_eq!(task.state(), ExecutionState::Cancelled);
        assert_eq!(
            task.cancellation_reason(),
            Some(CancellationReason::OutOfMemory)
        );
    }

    #[test]
    fn reason_is_recorded_once() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {});

        assert!(task.request_cancel(CancellationReason::Shutdown));
        assert!(!task.request_cancel(CancellationReason::UserRequest));
        assert_eq!(
            task.cancellation_reason(),
            Some(CancellationReason::Shutdown)
        );
    }

    #[test]
    fn sleep_and_wait_list_wakeup_roundtrip() {
        let processor = DummyProcessor::new();
        let list = Arc::new(WaitList::new());
        let (task, _handle) = test_task(&processor, {
            let list = list.clone();
            async move {
                let source = list.wait_until(Deadline::unreachable()).await;
                assert_eq!(source, WakeupSource::WaitList);
            }
        });

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Suspended);

        list.set_signal_and_wakeup_all();
        assert_eq!(task.state(), ExecutionState::Queued);

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);
    }

    #[test]
    fn passed_deadline_ends_the_sleep_without_timers() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {
            let mut strategy = CommonWaitStrategy;
            let source = suspend(&mut strategy, Deadline::passed()).await;
            assert_eq!(source, WakeupSource::DeadlineTimer);
        });

        // First step suspends; the short-circuited deadline wakeup lands as
        // a raced flag and reschedules immediately.
        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Queued);

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);
    }

    #[test]
    fn stale_epoch_wakeup_dissolves() {
        let processor = DummyProcessor::new();
        let list = Arc::new(WaitList::new());
        let (task, _handle) = test_task(&processor, {
            let list = list.clone();
            async move {
                list.wait_until(Deadline::unreachable()).await;
            }
        });

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Suspended);
        let sleeping_epoch = task.epoch();
        let scheduled_before = processor.schedule_count();

        // An epoch from a finished cycle must not wake anything.
        let stale = Epoch(sleeping_epoch.0.wrapping_sub(1));
        task.wakeup(WakeupSource::DeadlineTimer, stale);
        assert_eq!(task.state(), ExecutionState::Suspended);
        assert_eq!(processor.schedule_count(), scheduled_before);

        task.wakeup(WakeupSource::DeadlineTimer, sleeping_epoch);
        assert_eq!(task.state(), ExecutionState::Queued);
        assert_eq!(processor.schedule_count(), scheduled_before + 1);
    }

    #[test]
    fn racing_producers_schedule_exactly_once() {
        let processor = DummyProcessor::new();
        let list = Arc::new(WaitList::new());
        let (task, _handle) = test_task(&processor, {
            let list = list.clone();
            async move {
                list.wait_until(Deadline::unreachable()).await;
            }
        });

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Suspended);
        let epoch = task.epoch();
        let scheduled_before = processor.schedule_count();

        thread::scope(|scope| {
            for worker in 0..8 {
                let task = task.clone();
                scope.spawn(move || {
                    if worker % 2 == 0 {
                        task.wakeup(WakeupSource::DeadlineTimer, epoch);
                    } else {
                        task.wakeup_no_epoch(WakeupSource::WaitList);
                    }
                });
            }
        });

        assert_eq!(processor.schedule_count(), scheduled_before + 1);
    }

    #[test]
    fn wake_during_the_sleep_transition_is_not_lost() {
        let processor = DummyProcessor::new();
        let list = Arc::new(WaitList::new());
        let (task, _handle) = test_task(&processor, {
            let list = list.clone();
            async move {
                // Delivered while still Running: the sleeping flag is not set
                // yet, so the suspension epilogue must consume the raced bit.
                context::current_task().wakeup_no_epoch(WakeupSource::WaitList);
                let source = list.wait_until(Deadline::unreachable()).await;
                assert_eq!(source, WakeupSource::WaitList);
            }
        });

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Queued);

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);
    }

    #[test]
    fn racing_cancel_requests_record_one_reason() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {});

        let winners = AtomicUsize::new(0);
        thread::scope(|scope| {
            for reason in [
                CancellationReason::UserRequest,
                CancellationReason::Shutdown,
                CancellationReason::Deadline,
                CancellationReason::Overload,
            ] {
                let task = task.clone();
                let winners = &winners;
                scope.spawn(move || {
                    if task.request_cancel(reason) {
                        winners.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });

        assert_eq!(winners.load(Ordering::Relaxed), 1);
        assert!(task.is_cancel_requested());
    }

    #[test]
    fn cancel_does_not_wake_a_noncancellable_sleep() {
        let processor = DummyProcessor::new();
        let list = Arc::new(WaitList::new());
        let finished_cleanly = Arc::new(AtomicBool::new(false));
        let (task, _handle) = test_task(&processor, {
            let list = list.clone();
            let finished_cleanly = finished_cleanly.clone();
            async move {
                let _blocker = CancellationBlocker::new();
                let source = list.wait_until(Deadline::unreachable()).await;
                assert_eq!(source, WakeupSource::WaitList);
                finished_cleanly.store(true, Ordering::SeqCst);
            }
        });

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Suspended);
        let scheduled_before = processor.schedule_count();

        task.request_cancel(CancellationReason::UserRequest);
        // The reason is recorded but the sleep is not interrupted.
        assert!(task.is_cancel_requested());
        assert_eq!(task.state(), ExecutionState::Suspended);
        assert_eq!(processor.schedule_count(), scheduled_before);

        list.set_signal_and_wakeup_all();
        step_task(&task);

        assert!(finished_cleanly.load(Ordering::SeqCst));
        assert_eq!(task.state(), ExecutionState::Completed);
        assert_eq!(
            task.cancellation_reason(),
            Some(CancellationReason::UserRequest)
        );
    }

    #[test]
    fn cancel_during_noncancellable_run_fires_at_reenable() {
        let processor = DummyProcessor::new();
        let honored = Arc::new(AtomicBool::new(false));
        let (task, _handle) = test_task(&processor, {
            let honored = honored.clone();
            async move {
                let blocker = CancellationBlocker::new();
                let me = context::current_task();
                me.request_cancel(CancellationReason::UserRequest);
                assert!(!me.should_cancel());

                drop(blocker);
                assert!(me.should_cancel());

                let mut strategy = CommonWaitStrategy;
                let source = suspend(&mut strategy, Deadline::unreachable()).await;
                assert_eq!(source, WakeupSource::CancelRequest);
                honored.store(true, Ordering::SeqCst);
            }
        });

        step_task(&task);
        assert!(honored.load(Ordering::SeqCst));
        assert_eq!(task.state(), ExecutionState::Completed);
    }

    #[test]
    fn foreign_future_suspension_is_resumed_by_its_waker() {
        struct Gate {
            ready: AtomicBool,
            waker: Mutex<Option<std::task::Waker>>,
        }

        struct GateFuture(Arc<Gate>);

        impl Future for GateFuture {
            type Output = ();

            fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
                if self.0.ready.load(Ordering::Acquire) {
                    Poll::Ready(())
                } else {
                    *self.0.waker.lock() = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }

        let processor = DummyProcessor::new();
        let gate = Arc::new(Gate {
            ready: AtomicBool::new(false),
            waker: Mutex::new(None),
        });
        let (task, _handle) = test_task(&processor, {
            let gate = gate.clone();
            async move {
                GateFuture(gate).await;
            }
        });

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Suspended);

        gate.ready.store(true, Ordering::Release);
        let waker = gate.waker.lock().take().unwrap();
        waker.wake();
        assert_eq!(task.state(), ExecutionState::Queued);

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);
    }

    #[test]
    fn wakeup_after_finish_is_a_no_op() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {});

        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);
        let scheduled_before = processor.schedule_count();

        task.wakeup_no_epoch(WakeupSource::WaitList);
        task.wakeup(WakeupSource::DeadlineTimer, task.epoch());
        assert!(!task.request_cancel(CancellationReason::UserRequest));

        assert_eq!(processor.schedule_count(), scheduled_before);
        assert_eq!(task.state(), ExecutionState::Completed);
    }
}
