//! Task processors: where tasks get scheduled and executed.
//!
//! [`TaskProcessor`] is the seam between a task's control machinery and the
//! execution engine behind it. The production implementation is the
//! [`ThreadPool`](crate::processor::pool::ThreadPool); tests drive tasks by
//! hand through a dummy processor.

pub mod pool;

use crate::task::TaskContext;
use crate::timer::TimerService;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Executes tasks and owns the resources they run on.
///
/// A task holds its processor for its whole life: scheduling, coroutine
/// acquisition, timers and accounting all go through this trait.
pub trait TaskProcessor: Send + Sync + 'static {
    /// Enqueues a runnable task for execution. Called exactly once per
    /// wakeup that won the scheduling race.
    fn schedule(&self, task: Arc<TaskContext>);

    /// Acquires an execution slot from the coroutine pool. `None` means the
    /// pool is exhausted and the task must not start.
    fn acquire_coroutine(&self) -> Option<CoroutineSlot>;

    /// The timer service tasks of this processor arm their deadlines on.
    fn timer_service(&self) -> Arc<dyn TimerService>;

    /// Lifetime accounting for tasks of this processor.
    fn task_counter(&self) -> &TaskCounter;

    /// Takes ownership-level note of a newly created task.
    fn adopt(&self, task: &Arc<TaskContext>);

    /// Keeps `task` alive without any outside handle; used by detached
    /// tasks. The reference is dropped when the task finishes.
    fn detach(&self, task: Arc<TaskContext>);

    /// Called once when `task` reaches a terminal state.
    fn release(&self, task: &TaskContext);
}

/// A slot in a bounded coroutine pool. Holding the slot is the right to run
/// a task's payload; dropping it returns the capacity.
pub struct CoroutineSlot {
    pool: Arc<PoolInner>,
}

impl Drop for CoroutineSlot {
    fn drop(&mut self) {
        self.pool.available.fetch_add(1, Ordering::Release);
    }
}

/// Bounded pool of coroutine slots.
#[derive(Clone)]
pub(crate) struct CoroutinePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    available: AtomicUsize,
}

impl CoroutinePool {
    pub(crate) fn new(capacity: usize) -> Self {
        CoroutinePool {
            inner: Arc::new(PoolInner {
                available: AtomicUsize::new(capacity),
            }),
        }
    }

    pub(crate) fn acquire(&self) -> Option<CoroutineSlot> {
        let mut available = self.inner.available.load(Ordering::Acquire);
        loop {
            if available == 0 {
                return None;
            }
            match self.inner.available.compare_exchange_weak(
                available,
                available - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(CoroutineSlot {
                        pool: self.inner.clone(),
                    });
                }
                Err(current) => available = current,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.inner.available.load(Ordering::Acquire)
    }
}

/// Counts task lifetimes on a processor and lets shutdown wait for the
/// population to drain.
#[derive(Default)]
pub struct TaskCounter {
    created: AtomicUsize,
    finished: AtomicUsize,
    cancelled: AtomicUsize,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl TaskCounter {
    pub(crate) fn on_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_finished(&self, was_cancelled: bool) {
        if was_cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        self.finished.fetch_add(1, Ordering::Release);
        if self.alive() == 0 {
            let _guard = self.drain_lock.lock();
            self.drained.notify_all();
        }
    }

    /// Total tasks ever adopted by the processor.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Tasks that finished in the cancelled state.
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Tasks adopted but not yet finished.
    pub fn alive(&self) -> usize {
        let finished = self.finished.load(Ordering::Acquire);
        let created = self.created.load(Ordering::Acquire);
        created.saturating_sub(finished)
    }

    /// Blocks until every adopted task has finished.
    pub fn wait_for_drain(&self) {
        let mut guard = self.drain_lock.lock();
        while self.alive() != 0 {
            self.drained.wait(&mut guard);
        }
    }
}
