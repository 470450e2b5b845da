//! Type-erased task payloads.
//!
//! A task owns its payload as `Pin<Box<dyn Payload>>`; the typed layer
//! underneath routes the future's output (or the panic that escaped it) into
//! a [`ResultSlot`] shared with the task's handle. Cancellation is payload
//! destruction: dropping the box unwinds whatever the future held.

use parking_lot::Mutex;
use pin_project::pin_project;
use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// What a panicking payload left behind.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// One execution slice of a task's payload. `Ready` means the payload is
/// done for good, successfully or by panic.
pub(crate) trait Payload: Send {
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()>;
}

/// Hand-off cell for the payload's outcome, shared between the running task
/// and its handle.
pub(crate) struct ResultSlot<T> {
    value: Mutex<Option<Result<T, PanicPayload>>>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ResultSlot {
            value: Mutex::new(None),
        })
    }

    fn put(&self, result: Result<T, PanicPayload>) {
        let mut value = self.value.lock();
        debug_assert!(value.is_none(), "payload produced two results");
        *value = Some(result);
    }

    pub(crate) fn take(&self) -> Option<Result<T, PanicPayload>> {
        self.value.lock().take()
    }
}

#[pin_project]
pub(crate) struct TypedPayload<F, T>
where
    F: Future<Output = T>,
{
    #[pin]
    future: F,
    result: Arc<ResultSlot<T>>,
}

impl<F, T> TypedPayload<F, T>
where
    F: Future<Output = T>,
{
    pub(crate) fn new(future: F, result: Arc<ResultSlot<T>>) -> Self {
        TypedPayload { future, result }
    }
}

impl<F, T> Payload for TypedPayload<F, T>
where
    F: Future<Output = T> + Send,
    T: Send,
{
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match catch_unwind(AssertUnwindSafe(|| this.future.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.result.put(Ok(value));
                Poll::Ready(())
            }
            Err(panic) => {
                this.result.put(Err(panic));
                Poll::Ready(())
            }
        }
    }
}
