//! The cooperative scheduler.
//!
//! Single-threaded, priority-weighted round-robin: one task runs per tick
//! under a per-slice instruction budget, suspends at its next yield point,
//! and is re-enqueued once per priority unit. Terminal tasks leave no queue
//! entries behind; removal and suspension purge the queue explicitly.

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use log::{debug, trace};
use molt_runtime::{EntryFn, RunOutcome, Runner, TaskContext};
use molt_types::Value;

use crate::events::{EventHandler, SchedulerEvent};
use crate::task::{Task, TaskId, TaskState};

/// Default per-slice budget.
pub const DEFAULT_BUDGET_PER_SLICE: i64 = 100;

pub struct Scheduler {
    runner: Runner,
    tasks: BTreeMap<TaskId, Task>,
    run_queue: VecDeque<TaskId>,
    next_task_id: TaskId,
    tick_count: u64,
    is_running: bool,
    stop_requested: bool,
    budget_per_slice: i64,
    handlers: Vec<EventHandler>,
}

impl Scheduler {
    pub fn new(runner: Runner) -> Self {
        Self::with_budget_per_slice(runner, DEFAULT_BUDGET_PER_SLICE)
    }

    /// Budgets below 1 are clamped to 1.
    pub fn with_budget_per_slice(runner: Runner, budget_per_slice: i64) -> Self {
        Scheduler {
            runner,
            tasks: BTreeMap::new(),
            run_queue: VecDeque::new(),
            next_task_id: 1,
            tick_count: 0,
            is_running: false,
            stop_requested: false,
            budget_per_slice: budget_per_slice.max(1),
            handlers: Vec::new(),
        }
    }

    /// Registers a lifecycle-event observer.
    pub fn on_event(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    /// Adds a task; priorities below 1 are clamped to 1. The task enters the
    /// run queue exactly once.
    pub fn add_task<S: Into<String>>(&mut self, name: S, priority: u32, entry: EntryFn) -> TaskId {
        let id = self.next_task_id;
        self.next_task_id += 1;
        let task = Task {
            id,
            name: name.into(),
            priority: priority.max(1),
            entry,
            state: TaskState::Ready,
            continuation: None,
            result: None,
            error: None,
            yield_count: 0,
            consumed_budget: 0,
            context: TaskContext::new(),
        };
        debug!("task {id} `{}` added with priority {}", task.name, task.priority);
        self.tasks.insert(id, task);
        self.run_queue.push_back(id);
        id
    }

    /// Removes a task from the table and every run-queue occurrence.
    pub fn remove_task(&mut self, id: TaskId) -> bool {
        let existed = self.tasks.remove(&id).is_some();
        self.run_queue.retain(|queued| *queued != id);
        if existed {
            debug!("task {id} removed");
        }
        existed
    }

    /// Parks a task: suspended (or never-run) becomes waiting and all queue
    /// occurrences are purged.
    pub fn suspend_task(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if !matches!(task.state, TaskState::Ready | TaskState::Suspended) {
            return false;
        }
        let previous = task.state;
        task.state = TaskState::Waiting;
        let event = SchedulerEvent::TaskStateChanged {
            id,
            name: task.name.clone(),
            previous,
            current: TaskState::Waiting,
        };
        self.run_queue.retain(|queued| *queued != id);
        self.dispatch(vec![event]);
        true
    }

    /// Returns a waiting task to suspended and enqueues it once.
    pub fn wake_task(&mut self, id: TaskId) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        if task.state != TaskState::Waiting {
            return false;
        }
        task.state = TaskState::Suspended;
        let event = SchedulerEvent::TaskStateChanged {
            id,
            name: task.name.clone(),
            previous: TaskState::Waiting,
            current: TaskState::Suspended,
        };
        self.run_queue.push_back(id);
        self.dispatch(vec![event]);
        true
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn budget_per_slice(&self) -> i64 {
        self.budget_per_slice
    }

    /// Requests that the loop stop; the currently executing tick (if any)
    /// completes naturally. Calling before `run` makes the next `run` return
    /// promptly.
    pub fn stop(&mut self) {
        self.stop_requested = true;
        self.is_running = false;
    }

    /// Ticks until stopped or the queue empties.
    pub fn run(&mut self) {
        if self.stop_requested {
            self.stop_requested = false;
            return;
        }
        self.is_running = true;
        while self.is_running && !self.run_queue.is_empty() {
            self.tick();
        }
        self.is_running = false;
    }

    /// Performs at most `n` ticks; `n <= 0` is a no-op.
    pub fn run_for(&mut self, n: i64) {
        if n <= 0 {
            return;
        }
        if self.stop_requested {
            self.stop_requested = false;
            return;
        }
        self.is_running = true;
        for _ in 0..n {
            if !self.is_running || self.run_queue.is_empty() {
                break;
            }
            self.tick();
        }
        self.is_running = false;
    }

    /// One scheduler step: dequeue one task and run it for one slice.
    /// Returns false when the queue was empty. A dequeued entry whose task
    /// is gone or not run-eligible is discarded silently.
    pub fn tick(&mut self) -> bool {
        let Some(id) = self.run_queue.pop_front() else {
            return false;
        };
        self.tick_count += 1;

        let eligible = self
            .tasks
            .get(&id)
            .map(|task| task.state.is_run_eligible())
            .unwrap_or(false);
        if !eligible {
            trace!("discarding stale queue entry for task {id}");
            return true;
        }

        let mut events = Vec::new();
        let (entry, continuation, context) = {
            let task = self.tasks.get_mut(&id).expect("checked above");
            let previous = task.state;
            task.state = TaskState::Running;
            events.push(SchedulerEvent::TaskStateChanged {
                id,
                name: task.name.clone(),
                previous,
                current: TaskState::Running,
            });
            (
                Rc::clone(&task.entry),
                task.continuation.take(),
                Rc::clone(&task.context),
            )
        };

        context.reset_budget(self.budget_per_slice);
        let outcome = context.run_with(|| match &continuation {
            Some(state) => self.runner.resume(state, Value::Null),
            None => self.runner.run(&entry),
        });
        // Accumulate the decrement actually observed on the context the
        // runner used; the runner is contractually bound to this context.
        let consumed = (self.budget_per_slice - context.budget()).max(0) as u64;

        let task = self.tasks.get_mut(&id).expect("task present during tick");
        task.consumed_budget += consumed;
        match outcome {
            Ok(RunOutcome::Completed(result)) => {
                task.state = TaskState::Completed;
                task.result = Some(result.clone());
                events.push(SchedulerEvent::TaskStateChanged {
                    id,
                    name: task.name.clone(),
                    previous: TaskState::Running,
                    current: TaskState::Completed,
                });
                events.push(SchedulerEvent::TaskCompleted { id, result });
                debug!("task {id} completed after {} tick(s)", self.tick_count);
            }
            Ok(RunOutcome::Suspended { yielded, state }) => {
                task.continuation = Some(state);
                task.yield_count += 1;
                task.state = TaskState::Suspended;
                events.push(SchedulerEvent::TaskStateChanged {
                    id,
                    name: task.name.clone(),
                    previous: TaskState::Running,
                    current: TaskState::Suspended,
                });
                events.push(SchedulerEvent::TaskYielded { id, yielded });
                // Priority weighting: one queue entry per priority unit.
                for _ in 0..task.priority {
                    self.run_queue.push_back(id);
                }
            }
            Err(error) => {
                task.state = TaskState::Failed;
                task.error = Some(error.clone());
                events.push(SchedulerEvent::TaskStateChanged {
                    id,
                    name: task.name.clone(),
                    previous: TaskState::Running,
                    current: TaskState::Failed,
                });
                events.push(SchedulerEvent::TaskFailed { id, error });
                debug!("task {id} failed");
            }
        }

        self.dispatch(events);
        true
    }

    fn dispatch(&mut self, events: Vec<SchedulerEvent>) {
        for event in events {
            for handler in &mut self.handlers {
                handler(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests;
