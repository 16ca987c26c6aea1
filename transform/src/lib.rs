//! Molt component that rewrites annotated methods for capture and restore.
//!
//! The pipeline per method: build the control-flow graph, simulate the
//! operand stack, identify yield points, inject yield checks, wrap the body
//! in a capture catch-clause, prepend the restore prologue, and publish the
//! frame descriptor. The assembly rewriter drives it across every annotated
//! method and reports per-method failures.

pub mod cfg;
pub mod cost_model;
mod error;
pub mod options;
pub mod rewriter;
pub mod stack;
pub mod transformer;
pub mod yield_points;

pub use error::{AnalysisError, TransformError};
pub use options::{TransformOptions, DEFAULT_CONTINUABLE_ATTRIBUTE};
pub use rewriter::{rewrite_assembly, MethodFailure, RewriteError, RewriteReport};
pub use transformer::{transform_method, TransformOutcome};
pub use yield_points::{YieldPoint, YieldPointKind};
