//! Signal-once wait list.
//!
//! A [`WaitList`] collects wakers interested in a one-shot event (in this
//! crate: a task reaching a terminal state). Registration and signaling race
//! freely; the signaled flag is rechecked under the waiter lock so a waiter
//! either observes the signal or is guaranteed to be woken by it.

use crate::context;
use crate::deadline::Deadline;
use crate::task::WakeupSource;
use crate::wait::{EarlyWakeup, WaitStrategy, suspend};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::Waker;

/// Allocates a key identifying one waiter across repeated registrations on
/// the same [`WaitList`].
pub(crate) fn next_waiter_key() -> u64 {
    static NEXT_KEY: AtomicU64 = AtomicU64::new(1);
    NEXT_KEY.fetch_add(1, Ordering::Relaxed)
}

struct Waiter {
    key: u64,
    waker: Waker,
}

#[derive(Default)]
pub(crate) struct WaitList {
    signaled: AtomicBool,
    waiters: Mutex<SmallVec<[Waiter; 4]>>,
}

impl WaitList {
    pub(crate) fn new() -> Self {
        WaitList::default()
    }

    pub(crate) fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Registers `waker` under `key` unless the list is already signaled.
    /// Returns whether the signal was already set. A second registration
    /// under the same key replaces the previous waker.
    pub(crate) fn get_signal_or_append(&self, key: u64, waker: &Waker) -> bool {
        if self.is_signaled() {
            return true;
        }
        let mut waiters = self.waiters.lock();
        // The signal may have been set between the unlocked check and
        // acquiring the lock.
        if self.is_signaled() {
            return true;
        }
        if let Some(waiter) = waiters.iter_mut().find(|waiter| waiter.key == key) {
            waiter.waker.clone_from(waker);
        } else {
            waiters.push(Waiter {
                key,
                waker: waker.clone(),
            });
        }
        false
    }

    pub(crate) fn remove_waiter(&self, key: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|waiter| waiter.key == key) {
            waiters.swap_remove(pos);
        }
    }

    /// Sets the signal and wakes every registered waiter. Wakers run after
    /// the waiter lock is released.
    pub(crate) fn set_signal_and_wakeup_all(&self) {
        let waiters = {
            let mut waiters = self.waiters.lock();
            self.signaled.store(true, Ordering::Release);
            std::mem::take(&mut *waiters)
        };
        for waiter in waiters {
            waiter.waker.wake();
        }
    }

    /// Suspends the current task until the list is signaled or `deadline`
    /// passes. Spurious wait-list wakeups re-enter the sleep.
    pub(crate) async fn wait_until(&self, deadline: Deadline) -> WakeupSource {
        let key = next_waiter_key();
        loop {
            if self.is_signaled() {
                return WakeupSource::WaitList;
            }
            let mut strategy = WaitListStrategy { list: self, key };
            let source = suspend(&mut strategy, deadline).await;
            if source != WakeupSource::WaitList || self.is_signaled() {
                return source;
            }
        }
    }
}

/// Wait strategy parking the current task on a [`WaitList`].
pub(crate) struct WaitListStrategy<'a> {
    pub(crate) list: &'a WaitList,
    pub(crate) key: u64,
}

impl WaitStrategy for WaitListStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let task = context::current_task();
        let waker = crate::task::task_waker(task);
        EarlyWakeup(self.list.get_signal_or_append(self.key, &waker))
    }

    fn disable_wakeups(&mut self) {
        self.list.remove_waiter(self.key);
    }
}
