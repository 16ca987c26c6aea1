//! Runtime error taxonomy and the unwinding result variant.

use std::rc::Rc;

use molt_types::{SuspendSignal, Value};
use thiserror::Error;

/// Errors that terminate the current tick and fail the task.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Null where not permitted, or an out-of-range index.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// A slot value incompatible with the requested type.
    #[error("type mismatch: expected {expected}, found {observed}")]
    TypeMismatch { expected: String, observed: String },

    /// The frame chain revisits a record.
    #[error("frame chain contains a cycle")]
    CyclicChain,

    /// The frame chain exceeds the configured maximum depth.
    #[error("frame chain deeper than the permitted {max} frames")]
    ChainTooDeep { max: usize },

    /// No method body or entry point is known for the token.
    #[error("unknown method token {0}")]
    UnknownMethodToken(i32),

    /// Entry-point registry already holds this token.
    #[error("entry point for token {0} is already registered")]
    DuplicateEntryPoint(i32),

    /// A value thrown by user code that no handler caught.
    #[error("unhandled thrown value: {0}")]
    UserThrow(Value),

    /// Arithmetic fault (division by zero).
    #[error("arithmetic fault: {0}")]
    Arithmetic(String),

    /// Recursion deeper than the machine permits.
    #[error("call depth exceeded the permitted {max} frames")]
    CallDepthExceeded { max: usize },

    /// Malformed bytecode reached at execution time.
    #[error("invalid program at offset {offset}: {reason}")]
    InvalidProgram { offset: usize, reason: String },
}

/// The distinguished unwinding result.
///
/// A suspension is in-band control, not an error: it bubbles through
/// transformed frames by early return, is caught only by capture clauses,
/// and must never escape the runner. Faults terminate the tick.
#[derive(Debug, Clone)]
pub enum Unwind {
    Suspend(Rc<SuspendSignal>),
    Fault(RuntimeError),
}

impl From<RuntimeError> for Unwind {
    fn from(error: RuntimeError) -> Self {
        Unwind::Fault(error)
    }
}
