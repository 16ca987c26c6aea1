//! Task instances as the scheduler sees them.

use std::rc::Rc;

use molt_runtime::{EntryFn, RuntimeError, TaskContext};
use molt_types::{ContinuationState, Value};

/// Scheduler-assigned task identity.
pub type TaskId = u64;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Enqueued, never run.
    Ready,
    /// Currently executing a tick.
    Running,
    /// Suspended with saved state; eligible for further ticks.
    Suspended,
    /// Parked; not run until woken.
    Waiting,
    Completed,
    Failed,
}

impl TaskState {
    /// Whether a dequeued entry in this state may run.
    pub fn is_run_eligible(self) -> bool {
        matches!(self, TaskState::Ready | TaskState::Suspended)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Waiting => "waiting",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One schedulable task.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) priority: u32,
    pub(crate) entry: EntryFn,
    pub(crate) state: TaskState,
    pub(crate) continuation: Option<ContinuationState>,
    pub(crate) result: Option<Value>,
    pub(crate) error: Option<RuntimeError>,
    pub(crate) yield_count: u64,
    pub(crate) consumed_budget: u64,
    /// Task-bound context, reused across ticks.
    pub(crate) context: Rc<TaskContext>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The last captured continuation, while suspended.
    pub fn continuation(&self) -> Option<&ContinuationState> {
        self.continuation.as_ref()
    }

    /// Terminal result, once completed.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Terminal error, once failed.
    pub fn error(&self) -> Option<&RuntimeError> {
        self.error.as_ref()
    }

    /// How many times the task has yielded.
    pub fn yield_count(&self) -> u64 {
        self.yield_count
    }

    /// Accumulated budget units consumed across ticks, read off the task's
    /// own context after each slice.
    pub fn consumed_budget(&self) -> u64 {
        self.consumed_budget
    }

    /// The task-bound context (for yield handles and inspection).
    pub fn context(&self) -> &Rc<TaskContext> {
        &self.context
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("yield_count", &self.yield_count)
            .field("consumed_budget", &self.consumed_budget)
            .finish()
    }
}
