//! The task control machinery: per-task state, handles and wakeup plumbing.

// Public API
mod context;
pub use self::context::TaskContext;

pub(crate) mod error;
pub use self::error::{SharedTaskError, TaskError};

pub mod id;
pub use self::id::{Id, id, try_id};

mod join;
pub use self::join::{SharedTaskHandle, TaskHandle, WaitStatus};

// Re-exports
pub(crate) mod payload;
pub use self::payload::PanicPayload;

pub(crate) mod sleep_state;
pub use self::sleep_state::Epoch;

pub(crate) mod state;
pub use self::state::ExecutionState;

pub(crate) mod waker;
pub(crate) use self::waker::task_waker;

pub(crate) mod wakeup;
pub use self::wakeup::WakeupSource;
