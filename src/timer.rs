//! Deadline timers.
//!
//! Tasks arm two kinds of timers while sleeping: a wakeup timer that ends the
//! current sleep when its deadline passes, and a cancellation timer that
//! requests cancellation of the whole task. Both are armed through the
//! [`TimerService`] seam so tests can substitute a manually driven clock.
//!
//! [`TimerThread`] is the production implementation: one background thread
//! and a binary heap of pending entries. Disarming is cheap and eager about
//! releasing the task reference; the heap keeps an empty husk until the entry
//! comes due.

use crate::cancel::CancellationReason;
use crate::deadline::Deadline;
use crate::task::{Epoch, TaskContext, WakeupSource};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Arms timers on behalf of sleeping tasks.
///
/// Implementations hold a strong reference to the task for as long as the
/// entry is armed, so a task sleeping on a timer cannot be dropped out from
/// under it.
pub trait TimerService: Send + Sync + 'static {
    /// Arms a timer that wakes `task` from the sleep identified by `epoch`
    /// once `deadline` passes.
    fn arm_wakeup(&self, task: Arc<TaskContext>, deadline: Deadline, epoch: Epoch) -> TimerHandle;

    /// Arms a timer that requests cancellation of `task` with
    /// [`CancellationReason::Deadline`] once `deadline` passes.
    fn arm_cancel(&self, task: Arc<TaskContext>, deadline: Deadline) -> TimerHandle;
}

enum TimerAction {
    Wakeup { task: Arc<TaskContext>, epoch: Epoch },
    Cancel { task: Arc<TaskContext> },
}

impl TimerAction {
    fn fire(self) {
        match self {
            TimerAction::Wakeup { task, epoch } => {
                task.wakeup(WakeupSource::DeadlineTimer, epoch);
            }
            TimerAction::Cancel { task } => {
                task.request_cancel(CancellationReason::Deadline);
            }
        }
    }
}

/// The armed slot shared between the heap entry and the [`TimerHandle`].
/// Taking the action disarms the timer and releases the task reference.
struct ArmedEntry {
    action: Mutex<Option<TimerAction>>,
}

impl ArmedEntry {
    fn disarm(&self) -> Option<TimerAction> {
        self.action.lock().take()
    }
}

/// Owner of one armed timer. Dropping the handle disarms the timer; firing
/// and disarming race to take the action, so exactly one of them wins.
pub struct TimerHandle {
    entry: Option<Arc<ArmedEntry>>,
}

impl TimerHandle {
    /// A handle with nothing behind it, for paths that resolve a deadline
    /// synchronously instead of arming a timer.
    pub(crate) fn noop() -> Self {
        TimerHandle { entry: None }
    }

    fn armed(action: TimerAction) -> (Self, Arc<ArmedEntry>) {
        let entry = Arc::new(ArmedEntry {
            action: Mutex::new(Some(action)),
        });
        (
            TimerHandle {
                entry: Some(entry.clone()),
            },
            entry,
        )
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            drop(entry.disarm());
        }
    }
}

struct HeapEntry {
    due: Instant,
    seq: u64,
    entry: Arc<ArmedEntry>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

struct TimerQueue {
    entries: BinaryHeap<Reverse<HeapEntry>>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

/// Single background thread firing armed timers in deadline order.
pub struct TimerThread {
    shared: Arc<TimerShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerThread {
    pub fn spawn() -> Arc<Self> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                entries: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("strand-timer".to_owned())
                .spawn(move || run_timer_loop(&shared))
        };
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn the timer thread");
                None
            }
        };

        Arc::new(TimerThread {
            shared,
            worker: Mutex::new(worker),
        })
    }

    fn arm(&self, deadline: Deadline, action: TimerAction) -> TimerHandle {
        let Some(due) = due_instant(deadline) else {
            return TimerHandle::noop();
        };
        let (handle, entry) = TimerHandle::armed(action);
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                // Late arrivals during shutdown fire nothing.
                return TimerHandle::noop();
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.entries.push(Reverse(HeapEntry { due, seq, entry }));
        }
        self.shared.wakeup.notify_one();
        handle
    }

    /// Stops the worker thread. Entries not yet due are disarmed when their
    /// handles drop.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
        }
        self.shared.wakeup.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("timer thread panicked");
            }
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl TimerService for TimerThread {
    fn arm_wakeup(&self, task: Arc<TaskContext>, deadline: Deadline, epoch: Epoch) -> TimerHandle {
        self.arm(deadline, TimerAction::Wakeup { task, epoch })
    }

    fn arm_cancel(&self, task: Arc<TaskContext>, deadline: Deadline) -> TimerHandle {
        self.arm(deadline, TimerAction::Cancel { task })
    }
}

fn due_instant(deadline: Deadline) -> Option<Instant> {
    if !deadline.is_reachable() {
        return None;
    }
    // A passed deadline still goes through the queue and fires immediately.
    Some(deadline.instant().unwrap_or_else(Instant::now))
}

fn run_timer_loop(shared: &TimerShared) {
    let mut due_entries = Vec::new();
    loop {
        {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                let now = Instant::now();
                while let Some(Reverse(head)) = queue.entries.peek() {
                    if head.due > now {
                        break;
                    }
                    if let Some(Reverse(head)) = queue.entries.pop() {
                        due_entries.push(head.entry);
                    }
                }
                if !due_entries.is_empty() {
                    break;
                }
                match queue.entries.peek() {
                    Some(Reverse(head)) => {
                        let due = head.due;
                        shared.wakeup.wait_until(&mut queue, due);
                    }
                    None => shared.wakeup.wait(&mut queue),
                }
            }
        }
        // Fire outside the queue lock; a disarm racing us simply wins the
        // take and the entry is a husk by now.
        for entry in due_entries.drain(..) {
            if let Some(action) = entry.disarm() {
                action.fire();
            }
        }
    }
}
