use crate::deadline::Deadline;
use crate::processor::{CoroutinePool, CoroutineSlot, TaskCounter, TaskProcessor};
use crate::spawn::{self, TaskOpts};
use crate::task::state::ExecutionState;
use crate::task::{Epoch, SharedTaskHandle, TaskContext, TaskHandle};
use crate::timer::{TimerHandle, TimerService};
use futures::task::ArcWake;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Waker;

const DEFAULT_COROUTINE_SLOTS: usize = 16;

/// A processor that collects scheduled tasks in a queue and steps them only
/// when the test says so. Single logical clock, no worker threads.
pub(crate) struct DummyProcessor {
    queue: Mutex<VecDeque<Arc<TaskContext>>>,
    schedules: AtomicUsize,
    coroutines: CoroutinePool,
    counter: TaskCounter,
    timers: Arc<NoopTimers>,
    detached: Mutex<Vec<Arc<TaskContext>>>,
}

impl DummyProcessor {
    pub(crate) fn new() -> Arc<Self> {
        DummyProcessor::with_coroutine_slots(DEFAULT_COROUTINE_SLOTS)
    }

    pub(crate) fn with_coroutine_slots(slots: usize) -> Arc<Self> {
        Arc::new(DummyProcessor {
            queue: Mutex::new(VecDeque::new()),
            schedules: AtomicUsize::new(0),
            coroutines: CoroutinePool::new(slots),
            counter: TaskCounter::default(),
            timers: Arc::new(NoopTimers),
            detached: Mutex::new(Vec::new()),
        })
    }

    /// Total `schedule` calls ever made, stale or not.
    pub(crate) fn schedule_count(&self) -> usize {
        self.schedules.load(Ordering::Relaxed)
    }

    pub(crate) fn pop_scheduled(&self) -> Option<Arc<TaskContext>> {
        self.queue.lock().pop_front()
    }

    /// Steps the next queued task. An entry whose task got stepped through
    /// another path already is stale and gets skipped.
    pub(crate) fn run_next(&self) -> bool {
        let Some(task) = self.pop_scheduled() else {
            return false;
        };
        if task.state() == ExecutionState::Queued {
            task.do_step();
        }
        true
    }

    pub(crate) fn run_until_idle(&self) {
        while self.run_next() {}
    }

    pub(crate) fn counter(&self) -> &TaskCounter {
        &self.counter
    }
}

impl TaskProcessor for DummyProcessor {
    fn schedule(&self, task: Arc<TaskContext>) {
        self.schedules.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push_back(task);
    }

    fn acquire_coroutine(&self) -> Option<CoroutineSlot> {
        self.coroutines.acquire()
    }

    fn timer_service(&self) -> Arc<dyn TimerService> {
        self.timers.clone()
    }

    fn task_counter(&self) -> &TaskCounter {
        &self.counter
    }

    fn adopt(&self, _task: &Arc<TaskContext>) {
        self.counter.on_created();
    }

    fn detach(&self, task: Arc<TaskContext>) {
        self.detached.lock().push(task);
    }

    fn release(&self, task: &TaskContext) {
        self.counter
            .on_finished(task.state() == ExecutionState::Cancelled);
    }
}

/// Timer service that never fires. Deadlines that are already reached still
/// work: the task machinery resolves those without arming anything.
pub(crate) struct NoopTimers;

impl TimerService for NoopTimers {
    fn arm_wakeup(
        &self,
        _task: Arc<TaskContext>,
        _deadline: Deadline,
        _epoch: Epoch,
    ) -> TimerHandle {
        TimerHandle::noop()
    }

    fn arm_cancel(&self, _task: Arc<TaskContext>, _deadline: Deadline) -> TimerHandle {
        TimerHandle::noop()
    }
}

/// Creates an unstarted task on `processor`. Tests drive it with
/// [`step_task`]; the first step delivers the bootstrap wakeup implicitly.
pub(crate) fn test_task<F>(
    processor: &Arc<DummyProcessor>,
    future: F,
) -> (Arc<TaskContext>, TaskHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_for_test(processor, TaskOpts::empty(), future)
}

pub(crate) fn test_task_critical<F>(
    processor: &Arc<DummyProcessor>,
    future: F,
) -> (Arc<TaskContext>, TaskHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_for_test(processor, TaskOpts::CRITICAL, future)
}

fn spawn_for_test<F>(
    processor: &Arc<DummyProcessor>,
    opts: TaskOpts,
    future: F,
) -> (Arc<TaskContext>, TaskHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let dyn_processor: Arc<dyn TaskProcessor> = processor.clone();
    let (task, result) = spawn::spawn_with(dyn_processor, opts, Deadline::unreachable(), future);
    (task.clone(), TaskHandle::new(task, result))
}

pub(crate) fn test_shared_task<F>(
    processor: &Arc<DummyProcessor>,
    future: F,
) -> (Arc<TaskContext>, SharedTaskHandle<F::Output>)
where
    F: Future + Send + 'static,
    F::Output: Clone + Send + 'static,
{
    let dyn_processor: Arc<dyn TaskProcessor> = processor.clone();
    let (task, result) = spawn::spawn_with(
        dyn_processor,
        TaskOpts::empty(),
        Deadline::unreachable(),
        future,
    );
    (task.clone(), SharedTaskHandle::new(task, result))
}

/// Runs one execution slice. Unstarted tasks get their bootstrap wakeup
/// first, unless something (e.g. a pre-start cancellation) already consumed
/// it.
pub(crate) fn step_task(task: &Arc<TaskContext>) {
    if task.state() == ExecutionState::New {
        task.start();
    }
    task.do_step();
}

pub(crate) struct WakeCount {
    count: AtomicUsize,
}

impl WakeCount {
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl ArcWake for WakeCount {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A waker that increments a counter every time it is woken.
pub(crate) fn mock_waker() -> (Waker, Arc<WakeCount>) {
    let count = Arc::new(WakeCount {
        count: AtomicUsize::new(0),
    });
    (futures::task::waker(count.clone()), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_waker_counts_every_wake() {
        let (waker, wakes) = mock_waker();
        waker.wake_by_ref();
        assert_eq!(wakes.count(), 1);

        let second = waker.clone();
        second.wake();
        assert_eq!(wakes.count(), 2);

        drop(waker);
        assert_eq!(wakes.count(), 2);
    }

    #[test]
    fn stale_queue_entries_are_skipped() {
        let processor = DummyProcessor::new();
        let (task, _handle) = test_task(&processor, async {});

        task.start();
        step_task(&task);
        assert_eq!(task.state(), ExecutionState::Completed);

        // The queue still holds the bootstrap entry; stepping it again must
        // not re-run the finished task.
        processor.run_until_idle();
        assert_eq!(processor.counter().alive(), 0);
    }
}
