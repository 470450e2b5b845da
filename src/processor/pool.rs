//! The production task processor: a fixed pool of worker threads stepping
//! tasks from a shared run queue.
//!
//! Workers pop runnable tasks from a [`crossbeam_deque::Injector`] and park
//! on a condvar when it runs dry. The pool also owns the service side of the
//! task machinery: the timer thread, the coroutine pool bounding concurrent
//! payloads, and the task registry used for the shutdown cancellation sweep.

use crate::cancel::CancellationReason;
use crate::processor::{CoroutinePool, CoroutineSlot, TaskCounter, TaskProcessor};
use crate::spawn;
use crate::task::state::ExecutionState;
use crate::task::{Id, SharedTaskHandle, TaskContext, TaskHandle};
use crate::timer::{TimerService, TimerThread};
use anyhow::{Context as _, Result};
use crossbeam_deque::{Injector, Steal};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

const DEFAULT_COROUTINE_SLOTS: usize = 1024;
const DEFAULT_THREAD_NAME: &str = "strand-worker";

/// Configures and builds a [`ThreadPool`].
pub struct ThreadPoolBuilder {
    worker_threads: Option<usize>,
    coroutine_slots: usize,
    max_queue_length: usize,
    thread_name: String,
    thread_stack_size: Option<usize>,
}

impl ThreadPoolBuilder {
    fn new() -> Self {
        ThreadPoolBuilder {
            worker_threads: None,
            coroutine_slots: DEFAULT_COROUTINE_SLOTS,
            max_queue_length: 0,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            thread_stack_size: None,
        }
    }

    /// Sets the number of worker threads.
    ///
    /// Defaults to one worker per CPU core.
    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "worker threads cannot be set to 0");
        self.worker_threads = Some(val);
        self
    }

    /// Bounds how many tasks can hold an execution slot at once. A task past
    /// its first step keeps its slot until it finishes; spawns beyond the
    /// bound are cancelled with [`CancellationReason::OutOfMemory`].
    pub fn coroutine_slots(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "coroutine slots cannot be set to 0");
        self.coroutine_slots = val;
        self
    }

    /// Sets the overload watermark: while more than `val` tasks sit in the
    /// run queue, newly scheduled non-critical tasks are cancelled with
    /// [`CancellationReason::Overload`]. `0` (the default) disables shedding.
    pub fn max_queue_length(&mut self, val: usize) -> &mut Self {
        self.max_queue_length = val;
        self
    }

    /// Sets the name prefix of the pool's worker threads.
    ///
    /// The default is "strand-worker", yielding "strand-worker-{N}".
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        self.thread_name = val.into();
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Creates the configured `ThreadPool` and starts its threads.
    pub fn build(&mut self) -> Result<ThreadPool> {
        let worker_threads = self.worker_threads.unwrap_or_else(|| {
            thread::available_parallelism().map(usize::from).unwrap_or(1)
        });

        let shared = Arc::new(PoolShared {
            queue: Injector::new(),
            park_lock: Mutex::new(()),
            work_available: Condvar::new(),
            coroutines: CoroutinePool::new(self.coroutine_slots),
            timers: TimerThread::spawn(),
            counter: TaskCounter::default(),
            registry: Mutex::new(HashMap::new()),
            detached: Mutex::new(HashMap::new()),
            max_queue_length: self.max_queue_length,
            shutdown: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(worker_threads);
        for index in 0..worker_threads {
            let mut builder =
                thread::Builder::new().name(format!("{}-{index}", self.thread_name));
            if let Some(stack_size) = self.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let worker_shared = shared.clone();
            match builder.spawn(move || run_worker(worker_shared)) {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shared.shutdown.store(true, Ordering::SeqCst);
                    {
                        let _guard = shared.park_lock.lock();
                        shared.work_available.notify_all();
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(err).context("failed to spawn a worker thread");
                }
            }
        }

        tracing::debug!(workers = worker_threads, "task processor started");
        Ok(ThreadPool {
            shared,
            workers: Mutex::new(workers),
        })
    }
}

/// A multi-threaded [`TaskProcessor`].
///
/// Dropping the pool shuts it down: every live task gets a cancellation
/// request with [`CancellationReason::Shutdown`], the pool waits for the
/// task population to drain, then joins its threads. A task suspended
/// non-cancellably on a wakeup that never comes will make that wait hang;
/// such tasks must be woken by their owners before the pool goes away.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    /// A pool with `worker_threads` workers and default settings otherwise.
    pub fn new(worker_threads: usize) -> Result<ThreadPool> {
        ThreadPool::builder().worker_threads(worker_threads).build()
    }

    /// The processor handle tasks are spawned onto.
    pub fn processor(&self) -> Arc<dyn TaskProcessor> {
        self.shared.clone()
    }

    /// Spawns a task onto this pool with default options. See
    /// [`spawn_on`](crate::spawn_on).
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn::spawn_on(self.processor(), future)
    }

    /// Spawns a task whose result every clone of the handle can read. See
    /// [`spawn_shared_on`](crate::spawn_shared_on).
    pub fn spawn_shared<F>(&self, future: F) -> SharedTaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Clone + Send + 'static,
    {
        spawn::spawn_shared_on(self.processor(), future)
    }

    pub fn task_counter(&self) -> &TaskCounter {
        &self.shared.counter
    }

    /// Cancels every live task, waits for the population to drain and joins
    /// the worker threads. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("task processor shutting down");

        let live: Vec<Arc<TaskContext>> = {
            let registry = self.shared.registry.lock();
            registry.values().filter_map(Weak::upgrade).collect()
        };
        for task in live {
            task.request_cancel(CancellationReason::Shutdown);
        }

        self.shared.counter.wait_for_drain();

        {
            let _guard = self.shared.park_lock.lock();
            self.shared.work_available.notify_all();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!("a worker thread panicked");
            }
        }
        self.shared.timers.shutdown();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers.lock().len())
            .field("alive_tasks", &self.shared.counter.alive())
            .finish()
    }
}

struct PoolShared {
    queue: Injector<Arc<TaskContext>>,
    park_lock: Mutex<()>,
    work_available: Condvar,
    coroutines: CoroutinePool,
    timers: Arc<TimerThread>,
    counter: TaskCounter,
    registry: Mutex<HashMap<Id, Weak<TaskContext>>>,
    /// Strong references keeping detached tasks alive until they finish.
    detached: Mutex<HashMap<Id, Arc<TaskContext>>>,
    max_queue_length: usize,
    shutdown: AtomicBool,
}

impl PoolShared {
    /// Pops the next runnable task, parking until one arrives. `None` means
    /// the pool is shutting down and no task is left to run.
    fn next_task(&self) -> Option<Arc<TaskContext>> {
        loop {
            match self.queue.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Retry => continue,
                Steal::Empty => {}
            }

            let mut guard = self.park_lock.lock();
            if !self.queue.is_empty() {
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) && self.counter.alive() == 0 {
                return None;
            }
            self.work_available.wait(&mut guard);
        }
    }
}

impl TaskProcessor for PoolShared {
    fn schedule(&self, task: Arc<TaskContext>) {
        if self.max_queue_length != 0
            && self.queue.len() >= self.max_queue_length
            && !task.is_critical()
        {
            tracing::warn!(
                task = task.id().as_u64(),
                queue_length = self.queue.len(),
                "run queue overloaded, shedding task"
            );
            task.request_cancel(CancellationReason::Overload);
        }

        self.queue.push(task);
        let _guard = self.park_lock.lock();
        self.work_available.notify_one();
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

    fn adopt(&self, task: &Arc<TaskContext>) {
        self.counter.on_created();
        self.registry.lock().insert(task.id(), Arc::downgrade(task));
        if self.shutdown.load(Ordering::Acquire) {
            // The shutdown sweep may already be past; cancel up front so the
            // task unwinds at its first cancellation point.
            task.request_cancel(CancellationReason::Shutdown);
        }
    }

    fn detach(&self, task: Arc<TaskContext>) {
        let mut detached = self.detached.lock();
        // A finished task has already been released; keeping it would leak.
        if task.is_finished() {
            return;
        }
        detached.insert(task.id(), task);
    }

    fn release(&self, task: &TaskContext) {
        let id = task.id();
        self.registry.lock().remove(&id);
        self.detached.lock().remove(&id);
        self.counter
            .on_finished(task.state() == ExecutionState::Cancelled);
    }
}

fn run_worker(shared: Arc<PoolShared>) {
    tracing::trace!("worker thread started");
    while let Some(task) = shared.next_task() {
        task.do_step();
    }
    tracing::trace!("worker thread stopped");
}
