//! Provides the essential types for Molt.
//!
//! Everything the transformer, runtime, scheduler and validator share lives
//! here: the bytecode container model, runtime values, captured frames and
//! continuation snapshots, frame descriptors and the descriptor catalog.

pub mod builder;
pub mod bytecode;
pub mod descriptor;
pub mod frame;
pub mod typesig;
pub mod value;

pub use builder::MethodBuilder;
pub use bytecode::{
    Assembly, AssemblyId, HandlerKind, HandlerRegion, InstrOffset, Intrinsic, LocalIdx, LocalVar,
    MethodBody, MethodDef, MethodRef, MethodSig, Module, Opcode, TypeDef,
};
pub use descriptor::{DescriptorCatalog, DescriptorError, FrameDescriptor, SlotKind, SlotSpec};
pub use frame::{ContinuationState, FrameRecord, FrameRef, SuspendSignal, STATE_FORMAT_VERSION};
pub use typesig::TypeSig;
pub use value::{Value, ValueArray};
