//! Abstract operand-stack simulation.
//!
//! For every reachable instruction offset the simulator computes the stack
//! state on entry: its depth and the element types, bottom to top. Joins
//! require equal depth; conflicting element types widen to `TypeSig::Any`.
//! Unreachable code is never visited and gets no state.

use std::collections::{HashMap, VecDeque};

use molt_types::bytecode::{HandlerKind, InstrOffset, Intrinsic, MethodBody, MethodSig, Opcode};
use molt_types::TypeSig;

use crate::error::AnalysisError;

/// Reserved runtime type of the caught suspend signal.
pub const SUSPEND_SIGNAL_TYPE: &str = "molt.internal.SuspendSignal";
/// Reserved runtime type of frame records on the stack.
pub const FRAME_RECORD_TYPE: &str = "molt.internal.FrameRecord";

/// Stack state on entry to one instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct StackState {
    pub depth: usize,
    /// Element types, bottom to top; always `depth` entries.
    pub element_types: Vec<TypeSig>,
}

impl StackState {
    pub fn empty() -> Self {
        StackState {
            depth: 0,
            element_types: Vec::new(),
        }
    }

    fn of(element_types: Vec<TypeSig>) -> Self {
        StackState {
            depth: element_types.len(),
            element_types,
        }
    }
}

/// Per-offset simulation results.
#[derive(Debug, Default)]
pub struct StackMap {
    states: HashMap<InstrOffset, StackState>,
}

impl StackMap {
    /// Entry state for `offset`; `None` when the instruction is unreachable.
    pub fn at(&self, offset: InstrOffset) -> Option<&StackState> {
        self.states.get(&offset)
    }

    pub fn visited(&self, offset: InstrOffset) -> bool {
        self.states.contains_key(&offset)
    }
}

/// Runs the simulation over a method body.
pub fn simulate(body: &MethodBody, sig: &MethodSig) -> Result<StackMap, AnalysisError> {
    if body.instructions.is_empty() {
        return Err(AnalysisError::EmptyBody);
    }
    let mut map = StackMap::default();
    let mut worklist: VecDeque<InstrOffset> = VecDeque::new();

    merge_into(&mut map, &mut worklist, 0, StackState::empty())?;
    for handler in &body.handlers {
        let entry = match handler.kind {
            HandlerKind::CatchSuspend => {
                StackState::of(vec![TypeSig::Named(SUSPEND_SIGNAL_TYPE.into())])
            }
            HandlerKind::CatchAny => StackState::of(vec![TypeSig::Any]),
            HandlerKind::Finally => StackState::empty(),
        };
        merge_into(&mut map, &mut worklist, handler.handler_start, entry)?;
    }

    while let Some(offset) = worklist.pop_front() {
        let state = map.states[&offset].clone();
        let op = &body.instructions[offset];
        let flow = apply(op, state, offset, body, sig)?;
        match flow {
            Flow::Terminated => {}
            Flow::Continue(next) => {
                for target in op.branch_targets() {
                    merge_into(&mut map, &mut worklist, target, next.clone())?;
                }
                if !op.ends_block_unconditionally() {
                    if offset + 1 >= body.instructions.len() {
                        return Err(AnalysisError::FallsOffEnd { offset });
                    }
                    merge_into(&mut map, &mut worklist, offset + 1, next)?;
                }
            }
        }
    }

    Ok(map)
}

enum Flow {
    /// State after the instruction, flowing to targets and fallthrough.
    Continue(StackState),
    /// Return or throw: the block ends here.
    Terminated,
}

fn merge_into(
    map: &mut StackMap,
    worklist: &mut VecDeque<InstrOffset>,
    offset: InstrOffset,
    incoming: StackState,
) -> Result<(), AnalysisError> {
    match map.states.get_mut(&offset) {
        None => {
            map.states.insert(offset, incoming);
            worklist.push_back(offset);
        }
        Some(existing) => {
            if existing.depth != incoming.depth {
                return Err(AnalysisError::StackDepthMismatch {
                    offset,
                    left: existing.depth,
                    right: incoming.depth,
                });
            }
            let mut changed = false;
            for (have, got) in existing.element_types.iter_mut().zip(&incoming.element_types) {
                if have != got && *have != TypeSig::Any {
                    *have = TypeSig::Any;
                    changed = true;
                }
            }
            if changed {
                worklist.push_back(offset);
            }
        }
    }
    Ok(())
}

fn apply(
    op: &Opcode,
    mut state: StackState,
    offset: InstrOffset,
    body: &MethodBody,
    sig: &MethodSig,
) -> Result<Flow, AnalysisError> {
    let mut pop = |state: &mut StackState| -> Result<TypeSig, AnalysisError> {
        match state.element_types.pop() {
            Some(ty) => {
                state.depth -= 1;
                Ok(ty)
            }
            None => Err(AnalysisError::StackUnderflow { offset }),
        }
    };
    let push = |state: &mut StackState, ty: TypeSig| {
        state.element_types.push(ty);
        state.depth += 1;
    };

    match op {
        Opcode::Nop => {}
        Opcode::LdNull => push(&mut state, TypeSig::Any),
        Opcode::LdcBool(_) => push(&mut state, TypeSig::Bool),
        Opcode::LdcI4(_) => push(&mut state, TypeSig::I32),
        Opcode::LdcI8(_) => push(&mut state, TypeSig::I64),
        Opcode::LdcR8(_) => push(&mut state, TypeSig::F64),
        Opcode::LdStr(_) => push(&mut state, TypeSig::Str),
        Opcode::LdLoc(index) => {
            let ty = local_type(body, offset, *index)?;
            push(&mut state, ty);
        }
        Opcode::StLoc(index) => {
            local_type(body, offset, *index)?;
            pop(&mut state)?;
        }
        Opcode::LdArg(index) => {
            let ty = arg_type(sig, offset, *index)?;
            push(&mut state, ty);
        }
        Opcode::StArg(index) => {
            arg_type(sig, offset, *index)?;
            pop(&mut state)?;
        }
        Opcode::Dup => {
            let ty = pop(&mut state)?;
            push(&mut state, ty.clone());
            push(&mut state, ty);
        }
        Opcode::Pop => {
            pop(&mut state)?;
        }
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem => {
            let rhs = pop(&mut state)?;
            let lhs = pop(&mut state)?;
            push(&mut state, if lhs == rhs { lhs } else { TypeSig::Any });
        }
        Opcode::Neg => {
            let ty = pop(&mut state)?;
            push(&mut state, ty);
        }
        Opcode::Ceq | Opcode::Clt | Opcode::Cgt => {
            pop(&mut state)?;
            pop(&mut state)?;
            push(&mut state, TypeSig::Bool);
        }
        Opcode::Br(_) => {}
        Opcode::BrTrue(_) | Opcode::BrFalse(_) => {
            pop(&mut state)?;
        }
        Opcode::Switch(_) => {
            pop(&mut state)?;
        }
        Opcode::Ret => {
            if sig.ret.is_some() {
                pop(&mut state)?;
            }
            return Ok(Flow::Terminated);
        }
        Opcode::Throw => {
            pop(&mut state)?;
            return Ok(Flow::Terminated);
        }
        Opcode::Rethrow => {
            return Ok(Flow::Terminated);
        }
        Opcode::Call(mref) => {
            for _ in 0..mref.param_types.len() {
                pop(&mut state)?;
            }
            if let Some(ret) = &mref.return_type {
                push(&mut state, ret.clone());
            }
        }
        Opcode::CallIntrinsic(intrinsic) => {
            let (pops, pushes) = intrinsic_arity(intrinsic);
            for _ in 0..pops {
                pop(&mut state)?;
            }
            if let Some(ty) = pushes {
                push(&mut state, ty);
            }
        }
        Opcode::NewArr(elem) => {
            pop(&mut state)?;
            push(&mut state, TypeSig::Array(Box::new(elem.clone())));
        }
        Opcode::LdElem => {
            pop(&mut state)?;
            let array = pop(&mut state)?;
            let elem = match array {
                TypeSig::Array(elem) => *elem,
                _ => TypeSig::Any,
            };
            push(&mut state, elem);
        }
        Opcode::StElem => {
            pop(&mut state)?;
            pop(&mut state)?;
            pop(&mut state)?;
        }
        Opcode::LdLen => {
            pop(&mut state)?;
            push(&mut state, TypeSig::I32);
        }
        Opcode::Box(ty) | Opcode::Unbox(ty) => {
            pop(&mut state)?;
            push(&mut state, ty.clone());
        }
    }
    Ok(Flow::Continue(state))
}

/// Pops and pushes of each intrinsic; the push is the produced type.
fn intrinsic_arity(intrinsic: &Intrinsic) -> (usize, Option<TypeSig>) {
    match intrinsic {
        Intrinsic::LoadContext => (0, Some(TypeSig::I64)),
        Intrinsic::HandleYieldPoint => (2, None),
        Intrinsic::HandleYieldPointWithBudget => (3, None),
        Intrinsic::BeginRestore { .. } => (1, Some(TypeSig::Named(FRAME_RECORD_TYPE.into()))),
        Intrinsic::FrameYieldPointId => (1, Some(TypeSig::I32)),
        Intrinsic::FrameSlot => (2, Some(TypeSig::Any)),
        Intrinsic::NewFrameRecord { .. } => (3, Some(TypeSig::Named(FRAME_RECORD_TYPE.into()))),
        Intrinsic::SetFrameChain => (2, None),
        Intrinsic::ResumeValue => (0, Some(TypeSig::Any)),
        Intrinsic::YieldWith => (1, None),
    }
}

fn local_type(
    body: &MethodBody,
    offset: InstrOffset,
    index: u16,
) -> Result<TypeSig, AnalysisError> {
    body.locals
        .get(index as usize)
        .map(|local| local.ty.clone())
        .ok_or(AnalysisError::LocalOutOfRange {
            offset,
            index: index as usize,
            count: body.locals.len(),
        })
}

fn arg_type(sig: &MethodSig, offset: InstrOffset, index: u16) -> Result<TypeSig, AnalysisError> {
    sig.params
        .get(index as usize)
        .cloned()
        .ok_or(AnalysisError::ArgOutOfRange {
            offset,
            index: index as usize,
            count: sig.params.len(),
        })
}
