//! The method transformer.
//!
//! Rewrites one method so it can suspend and be restored: injects a yield
//! check at every yield point, wraps the body in a capture catch-clause, and
//! prepends a restore prologue with a dispatch table. Publishes the method's
//! frame descriptor to the catalog.
//!
//! Transformation is atomic per method: all edits happen on a working copy
//! that is only assigned back once every step has succeeded.

use std::collections::HashSet;

use bit_vec::BitVec;
use log::{debug, trace};
use molt_types::bytecode::{
    HandlerKind, HandlerRegion, InstrOffset, Intrinsic, LocalIdx, MethodBody, MethodDef, Opcode,
};
use molt_types::descriptor::{DescriptorCatalog, FrameDescriptor, SlotKind, SlotSpec};
use molt_types::{LocalVar, TypeSig};

use crate::cfg;
use crate::cost_model::checkpoint_cost;
use crate::error::TransformError;
use crate::options::TransformOptions;
use crate::stack::{self, FRAME_RECORD_TYPE, SUSPEND_SIGNAL_TYPE};
use crate::yield_points::{self, YieldPoint, YieldPointKind};

/// Result of transforming one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutcome {
    pub method_token: i32,
    /// Zero means the method had nothing to suspend at and was left alone.
    pub yield_point_count: usize,
    pub spill_temp_count: usize,
}

impl TransformOutcome {
    pub fn was_transformed(&self) -> bool {
        self.yield_point_count > 0
    }
}

/// Transforms `method` in place and publishes its descriptor.
///
/// A method with no yield points is returned untouched with a zero-count
/// outcome; there is no site it could suspend at, so neither the capture
/// clause nor the restore prologue would ever run.
pub fn transform_method(
    type_name: &str,
    method: &mut MethodDef,
    options: &TransformOptions,
    continuable_tokens: &HashSet<i32>,
    catalog: &mut DescriptorCatalog,
) -> Result<TransformOutcome, TransformError> {
    let body = method.body.as_ref().ok_or(TransformError::NoBody)?;
    let token = method.token(type_name);

    for (offset, op) in body.instructions.iter().enumerate() {
        if options.disallowed_opcodes.iter().any(|m| m == op.mnemonic()) {
            return Err(TransformError::DisallowedOpcode {
                offset,
                mnemonic: op.mnemonic().to_string(),
            });
        }
    }

    // Analysis runs against the untouched body.
    let graph = cfg::build(body)?;
    let stack_map = stack::simulate(body, &method.signature)?;
    let points = yield_points::find(body, &graph, &stack_map, options, continuable_tokens)?;

    if points.is_empty() {
        debug!("{type_name}::{} has no yield points, skipping", method.name);
        return Ok(TransformOutcome {
            method_token: token,
            yield_point_count: 0,
            spill_temp_count: 0,
        });
    }

    // Block lengths feed the cost model; captured before editing.
    let block_len_at: Vec<usize> = points
        .iter()
        .map(|p| graph.block_at(p.offset).map(|b| b.len()).unwrap_or(1))
        .collect();

    let arg_count = method.signature.params.len();
    let mut work = body.clone();

    // The original local count is the single source of truth for slot
    // packing; recorded before any synthetic local is added.
    let original_local_count = work.locals.len();

    // Synthetic locals, fixed order: ctx, frame, state, ex, record.
    let ctx = add_local(&mut work, "ctx", TypeSig::I64)?;
    let frame = add_local(&mut work, "frame", TypeSig::Named(FRAME_RECORD_TYPE.into()))?;
    let state = add_local(&mut work, "state", TypeSig::I32)?;
    let ex = add_local(&mut work, "ex", TypeSig::Named(SUSPEND_SIGNAL_TYPE.into()))?;
    let record = add_local(&mut work, "record", TypeSig::Named(FRAME_RECORD_TYPE.into()))?;

    let spill_count = points.iter().map(|p| p.stack.depth).max().unwrap_or(0);
    let spill_base = work.locals.len();
    for j in 0..spill_count {
        add_local(&mut work, &format!("spill{j}"), TypeSig::Any)?;
    }
    let spill_base = spill_base as LocalIdx;

    let mut editor = BodyEditor { body: work };

    // Yield checks, injected in descending offset order so earlier rewrites
    // never invalidate later anchors. `poll_starts` ends up id-ordered.
    let mut poll_starts: Vec<(i32, InstrOffset)> = Vec::with_capacity(points.len());
    for (point, block_len) in points.iter().zip(&block_len_at).rev() {
        let (seq, poll_rel) = build_yield_check(point, *block_len, options, ctx, state, spill_base);
        let inserted = seq.len();
        editor.splice_before_redirecting(point.offset, seq);
        for (_, start) in poll_starts.iter_mut() {
            *start += inserted;
        }
        poll_starts.push((point.id, point.offset + poll_rel));
        trace!(
            "{}::{} yield point {} anchored at {}",
            type_name, method.name, point.id, point.offset
        );
    }
    poll_starts.reverse();

    // Capture catch-clause around the whole rewritten body.
    let try_end = editor.body.instructions.len();
    let handler_start = try_end;
    let handler_seq = build_capture_handler(
        token,
        arg_count,
        original_local_count,
        spill_count,
        &method.signature.params,
        &editor.body.locals,
        state,
        ex,
        record,
        spill_base,
    );
    editor.body.instructions.extend(handler_seq);
    let handler_end = editor.body.instructions.len();
    editor.body.handlers.push(HandlerRegion {
        try_start: 0,
        try_end,
        handler_start,
        handler_end,
        kind: HandlerKind::CatchSuspend,
    });

    // Restore prologue with the dispatch table.
    let prologue = build_restore_prologue(
        token,
        arg_count,
        original_local_count,
        spill_count,
        &method.signature.params,
        &editor.body.locals,
        &poll_starts,
        ctx,
        frame,
        state,
        spill_base,
    );
    editor.splice_at_entry(prologue);

    // Descriptor publication.
    let descriptor = build_descriptor(
        token,
        &format!("{type_name}::{}", method.name),
        arg_count,
        original_local_count,
        spill_count,
        &method.signature.params,
        &editor.body.locals,
        &points,
    )?;
    catalog.insert(descriptor)?;

    method.body = Some(editor.body);
    debug!(
        "{type_name}::{} transformed: {} yield points, {} spill temps",
        method.name,
        points.len(),
        spill_count
    );
    Ok(TransformOutcome {
        method_token: token,
        yield_point_count: points.len(),
        spill_temp_count: spill_count,
    })
}

fn add_local(body: &mut MethodBody, name: &str, ty: TypeSig) -> Result<LocalIdx, TransformError> {
    if body.locals.len() >= u16::MAX as usize {
        return Err(TransformError::TooManyLocals {
            count: body.locals.len(),
            max: u16::MAX as usize,
        });
    }
    body.locals.push(LocalVar::named(name, ty));
    Ok((body.locals.len() - 1) as LocalIdx)
}

/// The check sequence spliced before a yield-point anchor. Returns the
/// sequence and the relative offset of the poll's first instruction (the
/// restore dispatch target).
fn build_yield_check(
    point: &YieldPoint,
    block_len: usize,
    options: &TransformOptions,
    ctx: LocalIdx,
    state: LocalIdx,
    spill_base: LocalIdx,
) -> (Vec<Opcode>, usize) {
    let mut seq = Vec::new();
    // Restore-dispatch tag; the capture handler records it.
    seq.push(Opcode::LdcI4(point.id));
    seq.push(Opcode::StLoc(state));
    // Spill a non-empty stack to temporaries, top down, so temp j holds the
    // j-th element from the bottom.
    let depth = point.stack.depth;
    for j in (0..depth).rev() {
        seq.push(Opcode::StLoc(spill_base + j as LocalIdx));
    }
    let poll_rel = seq.len();
    seq.push(Opcode::LdLoc(ctx));
    seq.push(Opcode::LdcI4(point.id));
    let budgeted =
        options.include_instruction_counting && point.kind == YieldPointKind::BackwardBranch;
    if budgeted {
        seq.push(Opcode::LdcI4(checkpoint_cost(block_len) as i32));
        seq.push(Opcode::CallIntrinsic(Intrinsic::HandleYieldPointWithBudget));
    } else {
        seq.push(Opcode::CallIntrinsic(Intrinsic::HandleYieldPoint));
    }
    // Reload spilled values in order, rebuilding the original stack.
    for j in 0..depth {
        seq.push(Opcode::LdLoc(spill_base + j as LocalIdx));
    }
    (seq, poll_rel)
}

/// The capture handler: store the signal, pack every slot into a fresh
/// array (one write per slot, the array alone on the stack afterwards),
/// construct the frame record, prepend it to the signal's chain, re-raise.
#[allow(clippy::too_many_arguments)]
fn build_capture_handler(
    method_token: i32,
    arg_count: usize,
    original_local_count: usize,
    spill_count: usize,
    params: &[TypeSig],
    locals: &[LocalVar],
    state: LocalIdx,
    ex: LocalIdx,
    record: LocalIdx,
    spill_base: LocalIdx,
) -> Vec<Opcode> {
    let total_slots = arg_count + original_local_count + spill_count;
    let mut seq = Vec::new();
    seq.push(Opcode::StLoc(ex));
    seq.push(Opcode::LdcI4(total_slots as i32));
    seq.push(Opcode::NewArr(TypeSig::Any));
    for (a, ty) in params.iter().enumerate() {
        seq.push(Opcode::Dup);
        seq.push(Opcode::LdcI4(a as i32));
        seq.push(Opcode::LdArg(a as LocalIdx));
        if ty.is_value_type() {
            seq.push(Opcode::Box(ty.clone()));
        }
        seq.push(Opcode::StElem);
    }
    for i in 0..original_local_count {
        seq.push(Opcode::Dup);
        seq.push(Opcode::LdcI4((arg_count + i) as i32));
        seq.push(Opcode::LdLoc(i as LocalIdx));
        if locals[i].ty.is_value_type() {
            seq.push(Opcode::Box(locals[i].ty.clone()));
        }
        seq.push(Opcode::StElem);
    }
    for j in 0..spill_count {
        seq.push(Opcode::Dup);
        seq.push(Opcode::LdcI4((arg_count + original_local_count + j) as i32));
        seq.push(Opcode::LdLoc(spill_base + j as LocalIdx));
        seq.push(Opcode::StElem);
    }
    // Stack here: exactly the slots array.
    seq.push(Opcode::LdLoc(ex));
    seq.push(Opcode::LdLoc(state));
    seq.push(Opcode::CallIntrinsic(Intrinsic::NewFrameRecord { method_token }));
    seq.push(Opcode::StLoc(record));
    seq.push(Opcode::LdLoc(ex));
    seq.push(Opcode::LdLoc(record));
    seq.push(Opcode::CallIntrinsic(Intrinsic::SetFrameChain));
    seq.push(Opcode::Rethrow);
    seq
}

/// The restore prologue: fall through to normal entry unless the current
/// context is restoring this method; otherwise pop the chain head, restore
/// every slot, and dispatch on the recorded yield-point id.
#[allow(clippy::too_many_arguments)]
fn build_restore_prologue(
    method_token: i32,
    arg_count: usize,
    original_local_count: usize,
    spill_count: usize,
    params: &[TypeSig],
    locals: &[LocalVar],
    poll_starts: &[(i32, InstrOffset)],
    ctx: LocalIdx,
    frame: LocalIdx,
    state: LocalIdx,
    spill_base: LocalIdx,
) -> Vec<Opcode> {
    let mut seq = Vec::new();
    seq.push(Opcode::CallIntrinsic(Intrinsic::LoadContext));
    seq.push(Opcode::StLoc(ctx));
    seq.push(Opcode::LdLoc(ctx));
    seq.push(Opcode::CallIntrinsic(Intrinsic::BeginRestore { method_token }));
    seq.push(Opcode::StLoc(frame));
    seq.push(Opcode::LdLoc(frame));
    let exit_branch = seq.len();
    seq.push(Opcode::BrFalse(0)); // patched to normal entry below
    seq.push(Opcode::LdLoc(frame));
    seq.push(Opcode::CallIntrinsic(Intrinsic::FrameYieldPointId));
    seq.push(Opcode::StLoc(state));
    for (a, ty) in params.iter().enumerate() {
        seq.push(Opcode::LdLoc(frame));
        seq.push(Opcode::LdcI4(a as i32));
        seq.push(Opcode::CallIntrinsic(Intrinsic::FrameSlot));
        if ty.is_value_type() {
            seq.push(Opcode::Unbox(ty.clone()));
        }
        seq.push(Opcode::StArg(a as LocalIdx));
    }
    for i in 0..original_local_count {
        seq.push(Opcode::LdLoc(frame));
        seq.push(Opcode::LdcI4((arg_count + i) as i32));
        seq.push(Opcode::CallIntrinsic(Intrinsic::FrameSlot));
        if locals[i].ty.is_value_type() {
            seq.push(Opcode::Unbox(locals[i].ty.clone()));
        }
        seq.push(Opcode::StLoc(i as LocalIdx));
    }
    for j in 0..spill_count {
        seq.push(Opcode::LdLoc(frame));
        seq.push(Opcode::LdcI4((arg_count + original_local_count + j) as i32));
        seq.push(Opcode::CallIntrinsic(Intrinsic::FrameSlot));
        seq.push(Opcode::StLoc(spill_base + j as LocalIdx));
    }
    seq.push(Opcode::LdLoc(state));
    let switch_at = seq.len();
    seq.push(Opcode::Switch(Vec::new())); // patched below
    let prologue_len = seq.len();

    // An id outside the table falls through the switch into normal entry.
    seq[exit_branch] = Opcode::BrFalse(prologue_len);
    let targets: Vec<InstrOffset> = poll_starts
        .iter()
        .map(|(_, start)| start + prologue_len)
        .collect();
    seq[switch_at] = Opcode::Switch(targets);
    seq
}

#[allow(clippy::too_many_arguments)]
fn build_descriptor(
    method_token: i32,
    method_name: &str,
    arg_count: usize,
    original_local_count: usize,
    spill_count: usize,
    params: &[TypeSig],
    locals: &[LocalVar],
    points: &[YieldPoint],
) -> Result<FrameDescriptor, TransformError> {
    let mut slots = Vec::with_capacity(arg_count + original_local_count + spill_count);
    for (a, ty) in params.iter().enumerate() {
        slots.push(SlotSpec {
            index: a as u16,
            name: None,
            kind: SlotKind::Argument,
            ty: ty.clone(),
            serialization_required: true,
        });
    }
    for i in 0..original_local_count {
        slots.push(SlotSpec {
            index: (arg_count + i) as u16,
            name: locals[i].name.clone(),
            kind: SlotKind::Local,
            ty: locals[i].ty.clone(),
            serialization_required: true,
        });
    }
    for j in 0..spill_count {
        slots.push(SlotSpec {
            index: (arg_count + original_local_count + j) as u16,
            name: None,
            kind: SlotKind::EvalStack,
            ty: TypeSig::Any,
            serialization_required: false,
        });
    }

    let ids: Vec<i32> = points.iter().map(|p| p.id).collect();
    let live: Vec<BitVec> = points
        .iter()
        .map(|p| {
            let mut map = BitVec::from_elem(slots.len(), false);
            for index in 0..arg_count + original_local_count {
                map.set(index, true);
            }
            for j in 0..p.stack.depth {
                map.set(arg_count + original_local_count + j, true);
            }
            map
        })
        .collect();

    Ok(FrameDescriptor::new(
        method_token,
        method_name,
        &slots,
        &ids,
        &live,
    )?)
}

/// In-place instruction editing with branch and handler fixup.
struct BodyEditor {
    body: MethodBody,
}

impl BodyEditor {
    /// Inserts `seq` before `anchor` in forward order. Branch targets and
    /// handler bounds beyond the anchor shift by the sequence length;
    /// references to the anchor itself keep their numeric value and so now
    /// reach the first inserted instruction.
    fn splice_before_redirecting(&mut self, anchor: InstrOffset, seq: Vec<Opcode>) {
        let n = seq.len();
        for op in &mut self.body.instructions {
            for target in op.branch_targets_mut() {
                if *target > anchor {
                    *target += n;
                }
            }
        }
        for handler in &mut self.body.handlers {
            shift_bound(&mut handler.try_start, anchor, n);
            shift_bound(&mut handler.try_end, anchor, n);
            shift_bound(&mut handler.handler_start, anchor, n);
            shift_bound(&mut handler.handler_end, anchor, n);
        }
        // Forward order: iterate naturally, inserting each before the anchor
        // slot it belongs at. A reversed iteration here would splice the
        // sequence backwards.
        for (i, op) in seq.into_iter().enumerate() {
            self.body.instructions.insert(anchor + i, op);
        }
    }

    /// Prepends `seq` as the new method entry. Every existing branch target
    /// and handler bound shifts; branches that pointed at the old first
    /// instruction keep pointing at it, not at the prologue.
    fn splice_at_entry(&mut self, seq: Vec<Opcode>) {
        let n = seq.len();
        for op in &mut self.body.instructions {
            for target in op.branch_targets_mut() {
                *target += n;
            }
        }
        for handler in &mut self.body.handlers {
            handler.try_start += n;
            handler.try_end += n;
            handler.handler_start += n;
            handler.handler_end += n;
        }
        let mut instructions = seq;
        instructions.append(&mut self.body.instructions);
        self.body.instructions = instructions;
    }
}

fn shift_bound(bound: &mut InstrOffset, anchor: InstrOffset, n: usize) {
    if *bound > anchor {
        *bound += n;
    }
}

#[cfg(test)]
mod tests;
