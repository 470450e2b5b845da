//! The packed `{flags, epoch}` word that synchronizes a sleeping task with
//! every wakeup producer.
//!
//! All sleep/wakeup coordination goes through a single `AtomicU64`: the low
//! half holds the [`SleepFlags`] bitset, the high half holds the sleep-cycle
//! [`Epoch`]. Every transition is a lock-free `fetch_or`, `exchange` or
//! `compare_exchange` on the packed word, which is what makes the
//! "exactly one wakeup wins" accounting possible.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub(crate) struct SleepFlags: u32 {
        /// The task has (or is about to have) no execution slice in flight
        /// and may be woken by producers.
        const SLEEPING = 1;

        /// The task went to sleep with cancellation observation disabled.
        /// A cancellation wakeup must not win against this flag.
        const NON_CANCELLABLE = 1 << 1;

        /// A wait-list signal fired for this task.
        const WAKEUP_BY_WAIT_LIST = 1 << 2;

        /// The per-sleep deadline timer fired.
        const WAKEUP_BY_DEADLINE_TIMER = 1 << 3;

        /// A cancellation request was delivered while the task slept.
        const WAKEUP_BY_CANCEL_REQUEST = 1 << 4;

        /// The initial wakeup that moves a freshly created task into the run
        /// queue for its first step.
        const WAKEUP_BY_BOOTSTRAP = 1 << 5;
    }
}

impl SleepFlags {
    pub(crate) const WAKEUP_ANY: SleepFlags = SleepFlags::WAKEUP_BY_WAIT_LIST
        .union(SleepFlags::WAKEUP_BY_DEADLINE_TIMER)
        .union(SleepFlags::WAKEUP_BY_CANCEL_REQUEST)
        .union(SleepFlags::WAKEUP_BY_BOOTSTRAP);
}

/// Sleep-cycle generation counter.
///
/// Captured by epoch-checked wakeup producers (deadline timers, cancellation
/// requests, bootstrap) when they arm themselves; a producer whose captured
/// epoch no longer matches the live word is stale and must be dropped.
/// Only equality is ever tested, so wrapping is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Epoch(pub(crate) u32);

impl Epoch {
    pub(crate) fn next(self) -> Epoch {
        Epoch(self.0.wrapping_add(1))
    }
}

/// An unpacked snapshot of the sleep word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SleepState {
    pub(crate) flags: SleepFlags,
    pub(crate) epoch: Epoch,
}

impl SleepState {
    pub(crate) const fn new(flags: SleepFlags, epoch: Epoch) -> Self {
        SleepState { flags, epoch }
    }

    /// The state a completed sleep cycle advances to: no flags, next epoch.
    pub(crate) fn next_epoch(self) -> SleepState {
        SleepState {
            flags: SleepFlags::empty(),
            epoch: self.epoch.next(),
        }
    }

    fn pack(self) -> u64 {
        (u64::from(self.epoch.0) << 32) | u64::from(self.flags.bits())
    }

    fn unpack(word: u64) -> Self {
        SleepState {
            flags: SleepFlags::from_bits_truncate(word as u32),
            epoch: Epoch((word >> 32) as u32),
        }
    }
}

pub(crate) struct AtomicSleepState(AtomicU64);

impl AtomicSleepState {
    pub(crate) fn new(initial: SleepState) -> Self {
        AtomicSleepState(AtomicU64::new(initial.pack()))
    }

    pub(crate) fn load(&self, order: Ordering) -> SleepState {
        SleepState::unpack(self.0.load(order))
    }

    pub(crate) fn store(&self, state: SleepState, order: Ordering) {
        self.0.store(state.pack(), order);
    }

    /// Clears the given flags, leaving the epoch untouched.
    pub(crate) fn clear_flags(&self, flags: SleepFlags, order: Ordering) {
        self.0.fetch_and(!u64::from(flags.bits()), order);
    }

    /// ORs the given flags in and returns the state *immediately before* the
    /// operation. The prior state is what wakeup arbitration runs on.
    pub(crate) fn fetch_or_flags(&self, flags: SleepFlags, order: Ordering) -> SleepState {
        SleepState::unpack(self.0.fetch_or(u64::from(flags.bits()), order))
    }

    pub(crate) fn exchange(&self, state: SleepState, order: Ordering) -> SleepState {
        SleepState::unpack(self.0.swap(state.pack(), order))
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: SleepState,
        new: SleepState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<SleepState, SleepState> {
        self.0
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(SleepState::unpack)
            .map_err(SleepState::unpack)
    }
}
