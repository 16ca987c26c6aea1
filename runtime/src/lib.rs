//! Molt capture/restore runtime.
//!
//! The task context carries the yield flag, the instruction budget and the
//! restore state; the machine executes rewritten bytecode; the runner drives
//! entry points and resumes captured continuations. Suspension travels as
//! the distinguished [`Unwind::Suspend`] result variant and never escapes
//! the runner.

pub mod context;
mod error;
pub mod machine;
pub mod runner;
pub mod slots;

pub use context::{TaskContext, YieldHandle, DEFAULT_BUDGET};
pub use error::{RuntimeError, Unwind};
pub use machine::{Machine, MAX_CALL_DEPTH};
pub use runner::{
    machine_entry, EntryFn, EntryPointRegistry, RunOutcome, Runner, MAX_RESUME_DEPTH,
};
