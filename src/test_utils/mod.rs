//! Hand-driven doubles for the processor seam, plus small helpers for
//! stepping tasks from tests.

pub(crate) mod mocks;
pub(crate) use mocks::{
    DummyProcessor, mock_waker, step_task, test_shared_task, test_task, test_task_critical,
};
