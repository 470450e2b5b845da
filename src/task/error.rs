use crate::cancel::CancellationReason;
use crate::task::payload::PanicPayload;
use std::fmt;

/// Why a task produced no value for its handle.
#[derive(thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled before its payload finished.
    #[error("task was cancelled: {0}")]
    Cancelled(CancellationReason),
    /// The payload panicked; the original panic value is carried along.
    #[error("task panicked")]
    Panicked(PanicPayload),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked(_))
    }

    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        match self {
            TaskError::Cancelled(reason) => Some(*reason),
            TaskError::Panicked(_) => None,
        }
    }

    /// Consumes the error, returning the captured panic value.
    ///
    /// # Panics
    ///
    /// Panics if the error is not [`TaskError::Panicked`]; check
    /// [`is_panic`](TaskError::is_panic) first.
    pub fn into_panic(self) -> PanicPayload {
        match self.try_into_panic() {
            Ok(panic) => panic,
            Err(err) => panic!("not a panic error: {err}"),
        }
    }

    pub fn try_into_panic(self) -> Result<PanicPayload, TaskError> {
        match self {
            TaskError::Panicked(panic) => Ok(panic),
            other => Err(other),
        }
    }
}

// Manual impl: the panic value is `dyn Any` and has no `Debug` of its own.
impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Cancelled(reason) => f.debug_tuple("Cancelled").field(reason).finish(),
            TaskError::Panicked(_) => f.write_str("Panicked(..)"),
        }
    }
}

/// Clonable variant of [`TaskError`] handed out by shared task handles. The
/// panic value itself cannot be cloned and is dropped.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedTaskError {
    #[error("task was cancelled: {0}")]
    Cancelled(CancellationReason),
    #[error("task panicked")]
    Panicked,
}

impl From<&TaskError> for SharedTaskError {
    fn from(err: &TaskError) -> Self {
        match err {
            TaskError::Cancelled(reason) => SharedTaskError::Cancelled(*reason),
            TaskError::Panicked(_) => SharedTaskError::Panicked,
        }
    }
}
