//! Molt state layer: validation of untrusted continuations, object-graph
//! tracking for serialization collaborators, the type allow-list/resolver,
//! and an identity-preserving JSON codec.

pub mod allowlist;
pub mod codec;
mod error;
pub mod tracker;
pub mod validator;

pub use allowlist::{documented_aliases, ResolverFn, TypeAllowList, TypeResolver};
pub use codec::{decode, encode};
pub use error::StateError;
pub use tracker::{ObjectGraphTracker, DEFAULT_ID_CEILING, NULL_SENTINEL_ID};
pub use validator::{
    StateValidator, ValidationFinding, ValidationOptions, ValidationReport,
    DEFAULT_MAX_STACK_DEPTH,
};
