//! The per-task context.
//!
//! One logical task has exactly one live context during a tick. The context
//! is thread-confined (`Rc` plus interior mutability); only the yield flag
//! is atomic, so an off-thread timer can request a yield through a
//! [`YieldHandle`]. `current()` is thread-local: distinct threads observe
//! independent current contexts.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use molt_types::{FrameRef, SuspendSignal, Value};

/// Default instruction budget installed by the runner when it has to create
/// a context itself.
pub const DEFAULT_BUDGET: i64 = 1_000;

thread_local! {
    static CURRENT: RefCell<Option<Rc<TaskContext>>> = const { RefCell::new(None) };
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Per-task execution state.
#[derive(Debug)]
pub struct TaskContext {
    id: u64,
    yield_requested: Arc<AtomicBool>,
    budget: Cell<i64>,
    is_restoring: Cell<bool>,
    frame_chain: RefCell<Option<FrameRef>>,
    resume_value: RefCell<Value>,
}

/// Cloneable, sendable handle that can request a yield from another thread.
#[derive(Debug, Clone)]
pub struct YieldHandle {
    flag: Arc<AtomicBool>,
}

impl YieldHandle {
    pub fn request_yield(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

impl TaskContext {
    pub fn new() -> Rc<Self> {
        Self::with_budget(DEFAULT_BUDGET)
    }

    pub fn with_budget(budget: i64) -> Rc<Self> {
        Rc::new(TaskContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            yield_requested: Arc::new(AtomicBool::new(false)),
            budget: Cell::new(budget),
            is_restoring: Cell::new(false),
            frame_chain: RefCell::new(None),
            resume_value: RefCell::new(Value::Null),
        })
    }

    /// Opaque id; transformed code carries it in its `ctx` local.
    pub fn context_id(&self) -> u64 {
        self.id
    }

    /// Sets the yield flag. Callable from any thread through a handle; here
    /// it is the scheduler-thread form.
    pub fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::Relaxed);
    }

    /// Clears the yield flag; idempotent.
    pub fn clear_yield_request(&self) {
        self.yield_requested.store(false, Ordering::Relaxed);
    }

    pub fn yield_requested(&self) -> bool {
        self.yield_requested.load(Ordering::Relaxed)
    }

    /// A sendable handle onto this context's yield flag.
    pub fn yield_handle(&self) -> YieldHandle {
        YieldHandle {
            flag: Arc::clone(&self.yield_requested),
        }
    }

    pub fn budget(&self) -> i64 {
        self.budget.get()
    }

    /// Sets the budget to `n`.
    pub fn reset_budget(&self, n: i64) {
        self.budget.set(n);
    }

    pub fn is_restoring(&self) -> bool {
        self.is_restoring.get()
    }

    pub fn set_restoring(&self, restoring: bool) {
        self.is_restoring.set(restoring);
    }

    pub fn frame_chain(&self) -> Option<FrameRef> {
        self.frame_chain.borrow().clone()
    }

    pub fn set_frame_chain(&self, chain: Option<FrameRef>) {
        *self.frame_chain.borrow_mut() = chain;
    }

    pub fn resume_value(&self) -> Value {
        self.resume_value.borrow().clone()
    }

    pub fn set_resume_value(&self, value: Value) {
        *self.resume_value.borrow_mut() = value;
    }

    /// Takes the resume value, leaving null; a task reads it at most once
    /// per resumption.
    pub fn take_resume_value(&self) -> Value {
        std::mem::replace(&mut *self.resume_value.borrow_mut(), Value::Null)
    }

    /// If a yield was requested: clears the request and raises the suspend
    /// signal carrying `id`. Otherwise a no-op. One atomic read per check.
    pub fn handle_yield_point(&self, id: i32) -> Result<(), Rc<SuspendSignal>> {
        if self.yield_requested.load(Ordering::Relaxed) {
            self.yield_requested.store(false, Ordering::Relaxed);
            return Err(SuspendSignal::new(id, Value::Null));
        }
        Ok(())
    }

    /// Charges `cost` against the budget, then raises the suspend signal iff
    /// the budget is exhausted or a yield was requested. `cost` may be zero
    /// or negative (restoring budget is permissible).
    pub fn handle_yield_point_with_budget(
        &self,
        id: i32,
        cost: i64,
    ) -> Result<(), Rc<SuspendSignal>> {
        let remaining = self.budget.get().saturating_sub(cost);
        self.budget.set(remaining);
        if remaining <= 0 || self.yield_requested.load(Ordering::Relaxed) {
            self.yield_requested.store(false, Ordering::Relaxed);
            return Err(SuspendSignal::new(id, Value::Null));
        }
        Ok(())
    }

    /// Installs `self` as the thread's current context for the duration of
    /// `body`. The previous current context is restored on every exit path,
    /// including unwinding panics, and the abrupt outcome propagates.
    pub fn run_with<T>(self: &Rc<Self>, body: impl FnOnce() -> T) -> T {
        let _guard = CurrentGuard::install(Rc::clone(self));
        body()
    }

    /// The thread's current context, if one is installed.
    pub fn current() -> Option<Rc<TaskContext>> {
        CURRENT.with(|current| current.borrow().clone())
    }
}

struct CurrentGuard {
    previous: Option<Rc<TaskContext>>,
}

impl CurrentGuard {
    fn install(ctx: Rc<TaskContext>) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(ctx));
        CurrentGuard { previous }
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}
