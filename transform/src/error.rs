//! Transformation error taxonomy.
//!
//! Analysis errors are inconsistencies discovered while reading a method
//! (control flow or stack simulation); transform errors are violations of
//! the injection-site invariants. Both are fatal for the method they were
//! found in and for that method only: the rewriter collects them per method
//! and carries on.

use molt_types::descriptor::DescriptorError;
use thiserror::Error;

/// CFG or operand-stack inconsistency.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum AnalysisError {
    #[error("operand stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },

    #[error("operand stack depth disagrees at join offset {offset}: {left} vs {right}")]
    StackDepthMismatch {
        offset: usize,
        left: usize,
        right: usize,
    },

    #[error("branch at offset {offset} targets out-of-range offset {target}")]
    BranchTargetOutOfRange { offset: usize, target: usize },

    #[error("local index {index} out of range at offset {offset} ({count} locals)")]
    LocalOutOfRange {
        offset: usize,
        index: usize,
        count: usize,
    },

    #[error("argument index {index} out of range at offset {offset} ({count} arguments)")]
    ArgOutOfRange {
        offset: usize,
        index: usize,
        count: usize,
    },

    #[error("control falls off the end of the instruction sequence from offset {offset}")]
    FallsOffEnd { offset: usize },

    #[error("yield point at offset {offset} lies inside a cleanup-finalizer region")]
    YieldInFinally { offset: usize },

    #[error("method body is empty")]
    EmptyBody,
}

/// Injection-site invariant violation; fatal per method.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum TransformError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("opcode `{mnemonic}` at offset {offset} is disallowed by the configured policy")]
    DisallowedOpcode { offset: usize, mnemonic: String },

    #[error("method has no body to transform")]
    NoBody,

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error("method declares {count} locals, more than the supported {max}")]
    TooManyLocals { count: usize, max: usize },
}
