mod context;
pub use context::{current_task, try_current_task};

pub mod cancel;
pub use cancel::{CancellationReason, CancellationToken, checkpoint};

pub mod deadline;
pub use deadline::Deadline;

pub mod processor;
pub use processor::pool::{ThreadPool, ThreadPoolBuilder};

mod spawn;
pub use spawn::{TaskBuilder, TaskOpts, spawn_on, spawn_shared_on};

pub mod task;
pub use task::{TaskError, TaskHandle};

pub mod time;

pub mod timer;

pub mod wait;

mod wait_list;

#[cfg(test)]
mod test_utils;
