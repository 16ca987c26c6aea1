//! Forward-emission method-body builder.
//!
//! Instructions are appended in execution order; forward branches are
//! emitted with a placeholder target and patched once the destination is
//! known. Used by the transformer's splice construction and by tests that
//! author user methods by hand.

use crate::bytecode::{HandlerKind, HandlerRegion, InstrOffset, LocalIdx, LocalVar, MethodBody, Opcode};
use crate::typesig::TypeSig;

/// Placeholder for a branch target that is patched later.
pub const PENDING_TARGET: InstrOffset = usize::MAX;

#[derive(Debug, Default)]
pub struct MethodBuilder {
    locals: Vec<LocalVar>,
    handlers: Vec<HandlerRegion>,
    instructions: Vec<Opcode>,
}

impl MethodBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a local and returns its index.
    pub fn local(&mut self, ty: TypeSig) -> LocalIdx {
        self.locals.push(LocalVar::new(ty));
        (self.locals.len() - 1) as LocalIdx
    }

    /// Declares a named local and returns its index.
    pub fn named_local<S: Into<String>>(&mut self, name: S, ty: TypeSig) -> LocalIdx {
        self.locals.push(LocalVar::named(name, ty));
        (self.locals.len() - 1) as LocalIdx
    }

    /// Appends an instruction and returns its offset.
    pub fn emit(&mut self, op: Opcode) -> InstrOffset {
        self.instructions.push(op);
        self.instructions.len() - 1
    }

    /// Offset the next emitted instruction will occupy.
    pub fn here(&self) -> InstrOffset {
        self.instructions.len()
    }

    /// Emits a branch with a pending target; patch with [`patch_branch`].
    ///
    /// [`patch_branch`]: MethodBuilder::patch_branch
    pub fn emit_pending_branch(&mut self, make: fn(InstrOffset) -> Opcode) -> InstrOffset {
        self.emit(make(PENDING_TARGET))
    }

    /// Points every target of the branch at `at` to `target`.
    pub fn patch_branch(&mut self, at: InstrOffset, target: InstrOffset) {
        for slot in self.instructions[at].branch_targets_mut() {
            *slot = target;
        }
    }

    /// Records an exception handler region.
    pub fn handler(
        &mut self,
        kind: HandlerKind,
        try_start: InstrOffset,
        try_end: InstrOffset,
        handler_start: InstrOffset,
        handler_end: InstrOffset,
    ) {
        self.handlers.push(HandlerRegion {
            try_start,
            try_end,
            handler_start,
            handler_end,
            kind,
        });
    }

    pub fn build(self) -> MethodBody {
        debug_assert!(
            self.instructions
                .iter()
                .flat_map(Opcode::branch_targets)
                .all(|t| t != PENDING_TARGET),
            "unpatched branch target"
        );
        MethodBody {
            locals: self.locals,
            handlers: self.handlers,
            instructions: self.instructions,
        }
    }
}
