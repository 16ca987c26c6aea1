//! The continuation runner.
//!
//! Drives one entry point, catches the suspend signal, and surfaces
//! completed/suspended outcomes. `run` never fabricates a shadow context
//! over an already-installed one: when a scheduler has installed the task's
//! context, that context (and its budget) is the one the computation sees.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use log::debug;
use molt_types::bytecode::Assembly;
use molt_types::descriptor::DescriptorCatalog;
use molt_types::{ContinuationState, FrameRef, Value};

use crate::context::TaskContext;
use crate::error::{RuntimeError, Unwind};
use crate::machine::Machine;

/// Maximum frames a resumed chain may hold.
pub const MAX_RESUME_DEPTH: usize = 1_000;

/// An entry-point callable: runs the computation under the given context.
pub type EntryFn = Rc<dyn Fn(&Rc<TaskContext>) -> Result<Value, Unwind>>;

/// Outcome of one run or resume.
#[derive(Debug)]
pub enum RunOutcome {
    /// The computation ran to its natural end.
    Completed(Value),
    /// The computation suspended; the state can be serialized and resumed.
    Suspended {
        yielded: Value,
        state: ContinuationState,
    },
}

impl RunOutcome {
    pub fn is_suspended(&self) -> bool {
        matches!(self, RunOutcome::Suspended { .. })
    }
}

/// Token-keyed mapping to the callable used to re-enter a method on resume.
/// Populated once by the rewriter's publication step, read-only after.
#[derive(Default)]
pub struct EntryPointRegistry {
    entries: HashMap<i32, EntryFn>,
}

impl EntryPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: i32, entry: EntryFn) -> Result<(), RuntimeError> {
        if self.entries.contains_key(&token) {
            return Err(RuntimeError::DuplicateEntryPoint(token));
        }
        self.entries.insert(token, entry);
        Ok(())
    }

    pub fn get(&self, token: i32) -> Option<EntryFn> {
        self.entries.get(&token).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publication: registers a machine-backed re-entry callable for every
    /// cataloged method of the rewritten assembly. Re-entry passes default
    /// argument values; the restore prologue overwrites them from the frame.
    pub fn publish_assembly(
        &mut self,
        assembly: &Rc<Assembly>,
        catalog: &DescriptorCatalog,
    ) -> Result<usize, RuntimeError> {
        let mut published = 0;
        for token in catalog.tokens() {
            let Some((_, method)) = assembly.find_method(token) else {
                continue;
            };
            let defaults: Vec<Value> = method
                .signature
                .params
                .iter()
                .map(Value::default_of)
                .collect();
            self.register(token, machine_entry(Rc::clone(assembly), token, defaults))?;
            published += 1;
        }
        debug!("published {published} entry point(s)");
        Ok(published)
    }
}

/// An entry callable that interprets `token` from `assembly` with fixed
/// arguments.
pub fn machine_entry(assembly: Rc<Assembly>, token: i32, args: Vec<Value>) -> EntryFn {
    Rc::new(move |ctx| Machine::new(&assembly).invoke(token, args.clone(), ctx))
}

/// Drives entries and resumes continuations.
pub struct Runner {
    registry: Rc<EntryPointRegistry>,
    max_chain_depth: usize,
}

impl Runner {
    pub fn new(registry: Rc<EntryPointRegistry>) -> Self {
        Runner {
            registry,
            max_chain_depth: MAX_RESUME_DEPTH,
        }
    }

    pub fn with_max_chain_depth(registry: Rc<EntryPointRegistry>, max_chain_depth: usize) -> Self {
        Runner {
            registry,
            max_chain_depth,
        }
    }

    /// Runs an entry point. An already-installed current context is used
    /// as-is (the scheduler's budget stays authoritative); otherwise a fresh
    /// context with the default budget is created and installed for the
    /// duration of the call.
    pub fn run(&self, entry: &EntryFn) -> Result<RunOutcome, RuntimeError> {
        match TaskContext::current() {
            Some(ctx) => classify(entry(&ctx)),
            None => {
                let ctx = TaskContext::new();
                ctx.run_with(|| classify(entry(&ctx)))
            }
        }
    }

    /// Resumes a captured continuation, passing `resume_value` back in.
    ///
    /// The chain is walked with cycle detection before anything runs; a
    /// cyclic or over-deep chain is rejected without invoking user code.
    pub fn resume(
        &self,
        state: &ContinuationState,
        resume_value: Value,
    ) -> Result<RunOutcome, RuntimeError> {
        let head = state.stack_head.clone().ok_or_else(|| {
            RuntimeError::Argument("continuation state has no captured stack".to_string())
        })?;
        let root_token = self.walk_chain(&head)?;
        let entry = self
            .registry
            .get(root_token)
            .ok_or(RuntimeError::UnknownMethodToken(root_token))?;

        let invoke = |ctx: &Rc<TaskContext>| {
            ctx.set_restoring(true);
            ctx.set_frame_chain(Some(Rc::clone(&head)));
            ctx.set_resume_value(resume_value.clone());
            classify(entry(ctx))
        };
        match TaskContext::current() {
            Some(ctx) => invoke(&ctx),
            None => {
                let ctx = TaskContext::new();
                ctx.run_with(|| invoke(&ctx))
            }
        }
    }

    /// Re-invokes `resume` until the computation completes; each resume
    /// passes the value produced by `resume_value_for` the latest yield.
    pub fn run_to_completion(
        &self,
        entry: &EntryFn,
        mut resume_value_for: impl FnMut(&Value) -> Value,
    ) -> Result<Value, RuntimeError> {
        let mut outcome = self.run(entry)?;
        loop {
            match outcome {
                RunOutcome::Completed(value) => return Ok(value),
                RunOutcome::Suspended { yielded, state } => {
                    let resume_value = resume_value_for(&yielded);
                    outcome = self.resume(&state, resume_value)?;
                }
            }
        }
    }

    /// Walks head-to-tail, rejecting cycles and over-deep chains; returns
    /// the root token (the chain head is the root frame).
    fn walk_chain(&self, head: &FrameRef) -> Result<i32, RuntimeError> {
        let root_token = head.borrow().method_token;
        let mut visited: HashSet<*const std::cell::RefCell<molt_types::FrameRecord>> =
            HashSet::new();
        let mut cursor = Some(Rc::clone(head));
        let mut depth = 0usize;
        while let Some(frame) = cursor {
            if !visited.insert(Rc::as_ptr(&frame)) {
                return Err(RuntimeError::CyclicChain);
            }
            depth += 1;
            if depth > self.max_chain_depth {
                return Err(RuntimeError::ChainTooDeep {
                    max: self.max_chain_depth,
                });
            }
            cursor = frame.borrow().caller.clone();
        }
        Ok(root_token)
    }
}

fn classify(result: Result<Value, Unwind>) -> Result<RunOutcome, RuntimeError> {
    match result {
        Ok(value) => Ok(RunOutcome::Completed(value)),
        Err(Unwind::Suspend(signal)) => Ok(RunOutcome::Suspended {
            yielded: signal.yielded_value(),
            state: signal.build_continuation_state(),
        }),
        Err(Unwind::Fault(error)) => Err(error),
    }
}
