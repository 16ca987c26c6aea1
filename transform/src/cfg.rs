//! Basic-block control-flow graph construction and back-edge discovery.

use std::collections::BTreeSet;

use molt_types::bytecode::{InstrOffset, MethodBody, Opcode};

use crate::error::AnalysisError;

/// A maximal straight-line instruction run. `end` is exclusive.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub index: usize,
    pub start: InstrOffset,
    pub end: InstrOffset,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

impl BasicBlock {
    /// Offset of the block's final instruction.
    pub fn last_offset(&self) -> InstrOffset {
        self.end - 1
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A loop-closing edge discovered during depth-first traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackEdge {
    /// Source block index.
    pub from: usize,
    /// Target block index; already on the DFS stack when `from` was explored.
    pub to: usize,
    /// Offset of the instruction that closes the loop (the source block's
    /// final instruction).
    pub branch_offset: InstrOffset,
}

#[derive(Debug)]
pub struct ControlFlowGraph {
    blocks: Vec<BasicBlock>,
    entry_block: usize,
    back_edges: Vec<BackEdge>,
    block_of: Vec<usize>,
}

impl ControlFlowGraph {
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn entry_block(&self) -> usize {
        self.entry_block
    }

    pub fn back_edges(&self) -> &[BackEdge] {
        &self.back_edges
    }

    /// The block containing `offset`.
    pub fn block_at(&self, offset: InstrOffset) -> Option<&BasicBlock> {
        self.block_of.get(offset).map(|index| &self.blocks[*index])
    }
}

/// Partitions a method body into basic blocks, wires successor and
/// predecessor edges, and discovers back-edges.
///
/// Leaders: the first instruction; every branch target; every instruction
/// following a branch, return or throw; the first instruction of every
/// handler region. Exception edges stay implicit, but each handler's first
/// block is a traversal root so it always appears in the graph.
pub fn build(body: &MethodBody) -> Result<ControlFlowGraph, AnalysisError> {
    let instructions = &body.instructions;
    if instructions.is_empty() {
        return Err(AnalysisError::EmptyBody);
    }
    let len = instructions.len();

    for (offset, op) in instructions.iter().enumerate() {
        for target in op.branch_targets() {
            if target >= len {
                return Err(AnalysisError::BranchTargetOutOfRange { offset, target });
            }
        }
    }

    let mut leaders: BTreeSet<InstrOffset> = BTreeSet::new();
    leaders.insert(0);
    for (offset, op) in instructions.iter().enumerate() {
        for target in op.branch_targets() {
            leaders.insert(target);
        }
        let splits_after = op.is_branch()
            || matches!(op, Opcode::Ret | Opcode::Throw | Opcode::Rethrow);
        if splits_after && offset + 1 < len {
            leaders.insert(offset + 1);
        }
    }
    for handler in &body.handlers {
        if handler.handler_start < len {
            leaders.insert(handler.handler_start);
        }
    }

    let starts: Vec<InstrOffset> = leaders.into_iter().collect();
    let mut blocks: Vec<BasicBlock> = starts
        .iter()
        .enumerate()
        .map(|(index, start)| BasicBlock {
            index,
            start: *start,
            end: starts.get(index + 1).copied().unwrap_or(len),
            successors: Vec::new(),
            predecessors: Vec::new(),
        })
        .collect();

    let mut block_of = vec![0usize; len];
    for block in &blocks {
        for offset in block.start..block.end {
            block_of[offset] = block.index;
        }
    }

    // Successor edges: fallthrough plus explicit branch targets.
    for index in 0..blocks.len() {
        let last = blocks[index].last_offset();
        let mut successors: Vec<usize> = Vec::new();
        let op = &instructions[last];
        let falls_through = !op.ends_block_unconditionally();
        for target in op.branch_targets() {
            successors.push(block_of[target]);
        }
        if falls_through {
            if blocks[index].end >= len {
                return Err(AnalysisError::FallsOffEnd { offset: last });
            }
            successors.push(block_of[blocks[index].end]);
        }
        successors.dedup();
        let mut seen = BTreeSet::new();
        successors.retain(|s| seen.insert(*s));
        blocks[index].successors = successors;
    }
    for index in 0..blocks.len() {
        for succ in blocks[index].successors.clone() {
            blocks[succ].predecessors.push(index);
        }
    }

    // Roots: the entry, each handler entry, then anything still unvisited so
    // unreachable loops are covered too.
    let mut roots: Vec<usize> = vec![block_of[0]];
    for handler in &body.handlers {
        if handler.handler_start < len {
            roots.push(block_of[handler.handler_start]);
        }
    }
    roots.extend(0..blocks.len());

    let back_edges = discover_back_edges(&blocks, &roots);

    Ok(ControlFlowGraph {
        entry_block: block_of[0],
        blocks,
        back_edges,
        block_of,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

/// An edge `u -> v` is a back-edge iff `v` is on the DFS stack when `u` is
/// explored. Iterative so adversarial inputs cannot blow the call stack.
fn discover_back_edges(blocks: &[BasicBlock], roots: &[usize]) -> Vec<BackEdge> {
    let mut color = vec![Color::White; blocks.len()];
    let mut back_edges = Vec::new();

    for root in roots {
        if color[*root] != Color::White {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(*root, 0)];
        color[*root] = Color::Grey;
        while let Some((block, next_succ)) = stack.last_mut() {
            let block = *block;
            if *next_succ >= blocks[block].successors.len() {
                color[block] = Color::Black;
                stack.pop();
                continue;
            }
            let succ = blocks[block].successors[*next_succ];
            *next_succ += 1;
            match color[succ] {
                Color::Grey => back_edges.push(BackEdge {
                    from: block,
                    to: succ,
                    branch_offset: blocks[block].last_offset(),
                }),
                Color::White => {
                    color[succ] = Color::Grey;
                    stack.push((succ, 0));
                }
                Color::Black => {}
            }
        }
    }
    back_edges
}

#[cfg(test)]
mod tests {
    use super::*;
    use molt_types::bytecode::{HandlerKind, HandlerRegion, LocalVar, Opcode};
    use molt_types::TypeSig;

    fn body(instructions: Vec<Opcode>) -> MethodBody {
        MethodBody {
            locals: vec![LocalVar::new(TypeSig::I32)],
            handlers: vec![],
            instructions,
        }
    }

    #[test]
    fn straight_line_is_one_block() {
        let cfg = build(&body(vec![Opcode::LdcI4(1), Opcode::Pop, Opcode::Ret])).unwrap();
        assert_eq!(cfg.blocks().len(), 1);
        assert!(cfg.back_edges().is_empty());
        assert!(cfg.blocks()[0].successors.is_empty());
    }

    #[test]
    fn loop_produces_one_back_edge() {
        // 0: ldc 0, 1: stloc, 2: ldloc, 3: ldc 3, 4: clt, 5: brfalse 9,
        // 6: nop, 7: nop, 8: br 2, 9: ret
        let cfg = build(&body(vec![
            Opcode::LdcI4(0),
            Opcode::StLoc(0),
            Opcode::LdLoc(0),
            Opcode::LdcI4(3),
            Opcode::Clt,
            Opcode::BrFalse(9),
            Opcode::Nop,
            Opcode::Nop,
            Opcode::Br(2),
            Opcode::Ret,
        ]))
        .unwrap();
        assert_eq!(cfg.back_edges().len(), 1);
        let edge = cfg.back_edges()[0];
        assert_eq!(edge.branch_offset, 8);
        assert_eq!(cfg.blocks()[edge.to].start, 2);
    }

    #[test]
    fn handler_block_appears_even_without_explicit_edges() {
        let mut b = body(vec![
            Opcode::LdcI4(1),
            Opcode::Pop,
            Opcode::Ret,
            // handler
            Opcode::Pop,
            Opcode::Rethrow,
        ]);
        b.handlers.push(HandlerRegion {
            try_start: 0,
            try_end: 3,
            handler_start: 3,
            handler_end: 5,
            kind: HandlerKind::CatchSuspend,
        });
        let cfg = build(&b).unwrap();
        assert!(cfg.blocks().iter().any(|block| block.start == 3));
        assert!(cfg.back_edges().is_empty());
    }

    #[test]
    fn unreachable_loop_is_still_traversed() {
        // 0: ret, unreachable loop at 1..=2
        let cfg = build(&body(vec![Opcode::Ret, Opcode::Nop, Opcode::Br(1)])).unwrap();
        assert_eq!(cfg.back_edges().len(), 1);
        assert_eq!(cfg.back_edges()[0].branch_offset, 2);
    }

    #[test]
    fn out_of_range_branch_is_rejected() {
        let err = build(&body(vec![Opcode::Br(7)])).unwrap_err();
        assert!(matches!(err, AnalysisError::BranchTargetOutOfRange { .. }));
    }

    #[test]
    fn falling_off_the_end_is_rejected() {
        let err = build(&body(vec![Opcode::Nop, Opcode::Nop])).unwrap_err();
        assert!(matches!(err, AnalysisError::FallsOffEnd { .. }));
    }
}
