//! The bytecode container model.
//!
//! Methods are sequences of stack-machine instructions; offsets are indices
//! into the instruction sequence. The whole container serializes to JSON so
//! assemblies can be rewritten on disk by the CLI and shipped between
//! processes.

use serde::{Deserialize, Serialize};

use crate::typesig::TypeSig;

/// Index of a local variable or argument.
pub type LocalIdx = u16;
/// Instruction offset: an index into a method's instruction sequence.
pub type InstrOffset = usize;

/// Assembly identity. External-zone membership is decided by comparing this
/// identity, never a module name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssemblyId(pub String);

impl AssemblyId {
    pub fn new<S: Into<String>>(name: S) -> Self {
        AssemblyId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AssemblyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a callable method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRef {
    pub assembly: AssemblyId,
    pub type_name: String,
    pub method_name: String,
    pub param_types: Vec<TypeSig>,
    /// Callee return type; `None` for void. Not part of the token.
    pub return_type: Option<TypeSig>,
}

impl MethodRef {
    /// Stable token of the referenced method.
    pub fn token(&self) -> i32 {
        let params: Vec<String> = self.param_types.iter().map(TypeSig::render_name).collect();
        molt_hash::method_token(
            &self.type_name,
            &self.method_name,
            params.iter().map(String::as_str),
        )
    }
}

impl std::fmt::Display for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]{}::{}", self.assembly, self.type_name, self.method_name)
    }
}

/// Runtime operations the transformer injects. These are the bytecode-visible
/// surface of the task context and the capture/restore machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intrinsic {
    /// Pushes an opaque handle to the current task context.
    LoadContext,
    /// Pops (id, ctx); suspends if a yield was requested.
    HandleYieldPoint,
    /// Pops (cost, id, ctx); charges the budget, then suspends if it ran out
    /// or a yield was requested.
    HandleYieldPointWithBudget,
    /// Pops the ctx handle; pushes the popped chain-head frame when the
    /// context is restoring this method, null otherwise.
    BeginRestore { method_token: i32 },
    /// Pops a frame; pushes its yield-point id.
    FrameYieldPointId,
    /// Pops (index, frame); pushes the packed slot value.
    FrameSlot,
    /// Pops (yield_point_id, signal, slots array); pushes a new frame record
    /// whose caller is the signal's current chain head.
    NewFrameRecord { method_token: i32 },
    /// Pops (frame, signal); installs the frame as the signal's chain head.
    SetFrameChain,
    /// Pushes the value passed back by the resume that revived this task
    /// (null outside a resumed tick).
    ResumeValue,
    /// Pops a value and suspends unconditionally, yielding it.
    YieldWith,
}

/// One stack-machine instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    Nop,
    // Constants.
    LdNull,
    LdcBool(bool),
    LdcI4(i32),
    LdcI8(i64),
    LdcR8(f64),
    LdStr(String),
    // Local and argument traffic.
    LdLoc(LocalIdx),
    StLoc(LocalIdx),
    LdArg(LocalIdx),
    StArg(LocalIdx),
    // Stack manipulation.
    Dup,
    Pop,
    // Arithmetic and comparison.
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,
    Ceq,
    Clt,
    Cgt,
    // Control flow. Targets are instruction offsets.
    Br(InstrOffset),
    BrTrue(InstrOffset),
    BrFalse(InstrOffset),
    /// Pops an int; jumps to `targets[value]` when in range, falls through
    /// otherwise.
    Switch(Vec<InstrOffset>),
    Ret,
    Throw,
    Rethrow,
    // Calls.
    Call(MethodRef),
    CallIntrinsic(Intrinsic),
    // Arrays.
    NewArr(TypeSig),
    LdElem,
    StElem,
    LdLen,
    // Boxing as checked conversion.
    Box(TypeSig),
    Unbox(TypeSig),
}

impl Opcode {
    /// All branch targets carried by this instruction, mutably, for fixup.
    pub fn branch_targets_mut(&mut self) -> Vec<&mut InstrOffset> {
        match self {
            Opcode::Br(t) | Opcode::BrTrue(t) | Opcode::BrFalse(t) => vec![t],
            Opcode::Switch(targets) => targets.iter_mut().collect(),
            _ => Vec::new(),
        }
    }

    /// All branch targets carried by this instruction.
    pub fn branch_targets(&self) -> Vec<InstrOffset> {
        match self {
            Opcode::Br(t) | Opcode::BrTrue(t) | Opcode::BrFalse(t) => vec![*t],
            Opcode::Switch(targets) => targets.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether control never falls through to the next instruction.
    /// `Switch` falls through on out-of-range values, so it does not count.
    pub fn ends_block_unconditionally(&self) -> bool {
        matches!(
            self,
            Opcode::Br(_) | Opcode::Ret | Opcode::Throw | Opcode::Rethrow
        )
    }

    /// Whether this is any branch instruction.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            Opcode::Br(_) | Opcode::BrTrue(_) | Opcode::BrFalse(_) | Opcode::Switch(_)
        )
    }

    /// Mnemonic for diagnostics and opcode policies.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::LdNull => "ldnull",
            Opcode::LdcBool(_) => "ldc.bool",
            Opcode::LdcI4(_) => "ldc.i4",
            Opcode::LdcI8(_) => "ldc.i8",
            Opcode::LdcR8(_) => "ldc.r8",
            Opcode::LdStr(_) => "ldstr",
            Opcode::LdLoc(_) => "ldloc",
            Opcode::StLoc(_) => "stloc",
            Opcode::LdArg(_) => "ldarg",
            Opcode::StArg(_) => "starg",
            Opcode::Dup => "dup",
            Opcode::Pop => "pop",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Rem => "rem",
            Opcode::Neg => "neg",
            Opcode::Ceq => "ceq",
            Opcode::Clt => "clt",
            Opcode::Cgt => "cgt",
            Opcode::Br(_) => "br",
            Opcode::BrTrue(_) => "brtrue",
            Opcode::BrFalse(_) => "brfalse",
            Opcode::Switch(_) => "switch",
            Opcode::Ret => "ret",
            Opcode::Throw => "throw",
            Opcode::Rethrow => "rethrow",
            Opcode::Call(_) => "call",
            Opcode::CallIntrinsic(_) => "call.intrinsic",
            Opcode::NewArr(_) => "newarr",
            Opcode::LdElem => "ldelem",
            Opcode::StElem => "stelem",
            Opcode::LdLen => "ldlen",
            Opcode::Box(_) => "box",
            Opcode::Unbox(_) => "unbox",
        }
    }
}

/// Kind of an exception handler region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    /// Catches only the suspend signal; the capture clause the transformer
    /// installs. The distinguished kind is what keeps user catch-alls from
    /// swallowing suspensions.
    CatchSuspend,
    /// User catch-all.
    CatchAny,
    /// Cleanup region; yield points inside one are a static analysis error.
    Finally,
}

/// A protected region and its handler. Bounds are half-open instruction
/// ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRegion {
    pub try_start: InstrOffset,
    pub try_end: InstrOffset,
    pub handler_start: InstrOffset,
    pub handler_end: InstrOffset,
    pub kind: HandlerKind,
}

impl HandlerRegion {
    pub fn protects(&self, offset: InstrOffset) -> bool {
        offset >= self.try_start && offset < self.try_end
    }

    pub fn covers_handler(&self, offset: InstrOffset) -> bool {
        offset >= self.handler_start && offset < self.handler_end
    }
}

/// Declared local variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVar {
    pub name: Option<String>,
    pub ty: TypeSig,
}

impl LocalVar {
    pub fn new(ty: TypeSig) -> Self {
        LocalVar { name: None, ty }
    }

    pub fn named<S: Into<String>>(name: S, ty: TypeSig) -> Self {
        LocalVar {
            name: Some(name.into()),
            ty,
        }
    }
}

/// Method signature: parameter types and optional return type.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MethodSig {
    pub params: Vec<TypeSig>,
    pub ret: Option<TypeSig>,
}

/// A method body: locals, exception handler regions and instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub locals: Vec<LocalVar>,
    pub handlers: Vec<HandlerRegion>,
    pub instructions: Vec<Opcode>,
}

/// A method definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub name: String,
    pub signature: MethodSig,
    pub attributes: Vec<String>,
    pub is_abstract: bool,
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// Stable token of this method as a member of `type_name`.
    pub fn token(&self, type_name: &str) -> i32 {
        let params: Vec<String> = self
            .signature
            .params
            .iter()
            .map(TypeSig::render_name)
            .collect();
        molt_hash::method_token(type_name, &self.name, params.iter().map(String::as_str))
    }
}

/// A type definition, possibly with nested types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// Full name, including any namespace.
    pub name: String,
    pub attributes: Vec<String>,
    pub methods: Vec<MethodDef>,
    pub nested: Vec<TypeDef>,
}

/// A module: one unit of types inside an assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub types: Vec<TypeDef>,
}

/// A complete assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assembly {
    pub name: AssemblyId,
    pub modules: Vec<Module>,
}

impl Assembly {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Assembly {
            name: AssemblyId::new(name),
            modules: Vec::new(),
        }
    }

    /// Finds a method body by token, searching nested types too.
    pub fn find_method(&self, token: i32) -> Option<(&TypeDef, &MethodDef)> {
        fn walk<'a>(ty: &'a TypeDef, token: i32) -> Option<(&'a TypeDef, &'a MethodDef)> {
            for method in &ty.methods {
                if method.token(&ty.name) == token {
                    return Some((ty, method));
                }
            }
            ty.nested.iter().find_map(|nested| walk(nested, token))
        }
        self.modules
            .iter()
            .flat_map(|module| module.types.iter())
            .find_map(|ty| walk(ty, token))
    }
}
