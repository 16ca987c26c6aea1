//! Scheduler lifecycle events.
//!
//! Events are dispatched synchronously on the scheduler thread, in the
//! observed order of state transitions; handlers must not assume any thread
//! safety beyond that.

use molt_runtime::RuntimeError;
use molt_types::Value;

use crate::task::{TaskId, TaskState};

/// A lifecycle notification.
#[derive(Debug)]
pub enum SchedulerEvent {
    TaskStateChanged {
        id: TaskId,
        name: String,
        previous: TaskState,
        current: TaskState,
    },
    TaskYielded {
        id: TaskId,
        yielded: Value,
    },
    TaskCompleted {
        id: TaskId,
        result: Value,
    },
    TaskFailed {
        id: TaskId,
        error: RuntimeError,
    },
}

/// Registered observer of scheduler events.
pub type EventHandler = Box<dyn FnMut(&SchedulerEvent)>;
