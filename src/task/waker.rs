#![allow(unsafe_op_in_unsafe_fn)]

use crate::task::{TaskContext, WakeupSource};

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops;
use std::sync::Arc;
use std::task::{RawWaker, RawWakerVTable, Waker};

/// Waking a task reports a wait-list wakeup: the waker is what this crate
/// hands to payload futures, and anything holding a clone of it is by
/// definition an external wakeup source without access to the sleep epoch.
pub(crate) struct WakerRef<'a> {
    waker: ManuallyDrop<Waker>,
    _p: PhantomData<&'a Arc<TaskContext>>,
}

/// Returns a `WakerRef` which avoids having to preemptively increase the
/// refcount if there is no need to do so.
pub(crate) fn waker_ref(task: &Arc<TaskContext>) -> WakerRef<'_> {
    // `Waker::will_wake` uses the VTABLE pointer as part of the check. This
    // means that `will_wake` will always return false when using the current
    // task's waker. (discussion at rust-lang/rust#66281).
    //
    // To fix this, we use a single vtable. Since we pass in a reference at this
    // point and not an *owned* waker, we must ensure that `drop` is never
    // called on this waker instance. This is done by wrapping it with
    // `ManuallyDrop` and then never calling drop.
    let waker = unsafe { ManuallyDrop::new(Waker::from_raw(raw_waker(Arc::as_ptr(task)))) };

    WakerRef {
        waker,
        _p: PhantomData,
    }
}

/// An owned waker holding its own reference to the task.
pub(crate) fn task_waker(task: Arc<TaskContext>) -> Waker {
    unsafe { Waker::from_raw(raw_waker(Arc::into_raw(task))) }
}

impl ops::Deref for WakerRef<'_> {
    type Target = Waker;

    fn deref(&self) -> &Waker {
        &self.waker
    }
}

unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
    Arc::increment_strong_count(ptr as *const TaskContext);
    RawWaker::new(ptr, &WAKER_VTABLE)
}

unsafe fn drop_waker(ptr: *const ()) {
    drop(Arc::from_raw(ptr as *const TaskContext));
}

// Wake by consuming the waker.
unsafe fn wake_by_val(ptr: *const ()) {
    let task = Arc::from_raw(ptr as *const TaskContext);
    task.wakeup_no_epoch(WakeupSource::WaitList);
}

// Wake without consuming the waker.
unsafe fn wake_by_ref(ptr: *const ()) {
    let task = ManuallyDrop::new(Arc::from_raw(ptr as *const TaskContext));
    task.wakeup_no_epoch(WakeupSource::WaitList);
}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(clone_waker, wake_by_val, wake_by_ref, drop_waker);

fn raw_waker(task: *const TaskContext) -> RawWaker {
    RawWaker::new(task as *const (), &WAKER_VTABLE)
}
