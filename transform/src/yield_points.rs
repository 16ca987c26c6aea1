//! Yield-point identification.
//!
//! Produces the ordered, id-numbered list of suspension points for one
//! method from its CFG and stack simulation. Ids are dense from 0 and
//! assigned in instruction-offset order; no two points share an instruction.

use std::collections::{BTreeMap, HashSet};

use molt_types::bytecode::{InstrOffset, MethodBody, Opcode};

use crate::cfg::ControlFlowGraph;
use crate::error::AnalysisError;
use crate::options::TransformOptions;
use crate::stack::{StackMap, StackState};

/// What kind of site a yield point guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldPointKind {
    /// A loop-closing branch.
    BackwardBranch,
    /// A call leaving the trust zone, or a call to a continuable method
    /// (which needs a resume label at its call site either way).
    ExternalCall,
}

/// One suspension site.
#[derive(Debug, Clone)]
pub struct YieldPoint {
    /// Dense id, assigned in offset order starting at 0.
    pub id: i32,
    /// The anchor instruction the check is injected before.
    pub offset: InstrOffset,
    pub kind: YieldPointKind,
    /// Simulated operand stack on entry to the anchor. A non-empty stack is
    /// a spill requirement for the transformer.
    pub stack: StackState,
}

/// Finds the yield points of a method.
///
/// `continuable_tokens` holds the tokens of every continuable method in the
/// assembly being rewritten, so call sites that can suspend get a resume
/// label even when external-call checking is off.
pub fn find(
    body: &MethodBody,
    cfg: &ControlFlowGraph,
    stack_map: &StackMap,
    options: &TransformOptions,
    continuable_tokens: &HashSet<i32>,
) -> Result<Vec<YieldPoint>, AnalysisError> {
    // Offset-keyed so the final numbering is in instruction order and a
    // shared anchor collapses to one point.
    let mut sites: BTreeMap<InstrOffset, YieldPointKind> = BTreeMap::new();

    if options.include_backward_branches {
        for edge in cfg.back_edges() {
            sites.entry(edge.branch_offset)
                .or_insert(YieldPointKind::BackwardBranch);
        }
    }

    for (offset, op) in body.instructions.iter().enumerate() {
        if let Opcode::Call(mref) = op {
            let external = !options.is_internal_assembly(mref.assembly.as_str());
            let continuable = continuable_tokens.contains(&mref.token());
            if (options.include_external_calls && external) || continuable {
                sites.entry(offset).or_insert(YieldPointKind::ExternalCall);
            }
        }
    }

    let mut points = Vec::with_capacity(sites.len());
    for (id, (offset, kind)) in sites.into_iter().enumerate() {
        if in_finally_region(body, offset) {
            return Err(AnalysisError::YieldInFinally { offset });
        }
        // Unreachable anchors cannot execute; skip rather than guard them.
        let stack = match stack_map.at(offset) {
            Some(state) => state.clone(),
            None => continue,
        };
        points.push(YieldPoint {
            id: id as i32,
            offset,
            kind,
            stack,
        });
    }
    // Re-number densely in case unreachable anchors were dropped.
    for (id, point) in points.iter_mut().enumerate() {
        point.id = id as i32;
    }
    Ok(points)
}

fn in_finally_region(body: &MethodBody, offset: InstrOffset) -> bool {
    body.handlers
        .iter()
        .any(|h| h.kind == molt_types::bytecode::HandlerKind::Finally && h.covers_handler(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cfg, stack};
    use molt_types::bytecode::{
        AssemblyId, HandlerKind, HandlerRegion, LocalVar, MethodRef, MethodSig,
    };
    use molt_types::TypeSig;

    fn loop_body() -> MethodBody {
        MethodBody {
            locals: vec![LocalVar::new(TypeSig::I32)],
            handlers: vec![],
            instructions: vec![
                Opcode::LdcI4(0),
                Opcode::StLoc(0),
                Opcode::LdLoc(0),
                Opcode::LdcI4(5),
                Opcode::Clt,
                Opcode::BrFalse(11),
                Opcode::LdLoc(0),
                Opcode::LdcI4(1),
                Opcode::Add,
                Opcode::StLoc(0),
                Opcode::Br(2),
                Opcode::Ret,
            ],
        }
    }

    fn call(assembly: &str, name: &str) -> Opcode {
        Opcode::Call(MethodRef {
            assembly: AssemblyId::new(assembly),
            type_name: "T".into(),
            method_name: name.into(),
            param_types: vec![],
            return_type: None,
        })
    }

    fn analyze(
        body: &MethodBody,
        options: &TransformOptions,
        continuable: &HashSet<i32>,
    ) -> Result<Vec<YieldPoint>, AnalysisError> {
        let graph = cfg::build(body).unwrap();
        let map = stack::simulate(body, &MethodSig::default()).unwrap();
        find(body, &graph, &map, options, continuable)
    }

    #[test]
    fn back_edge_anchor_is_the_closing_branch() {
        let points = analyze(&loop_body(), &TransformOptions::default(), &HashSet::new()).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].id, 0);
        assert_eq!(points[0].offset, 10);
        assert_eq!(points[0].kind, YieldPointKind::BackwardBranch);
        assert_eq!(points[0].stack.depth, 0);
    }

    #[test]
    fn ids_are_dense_and_offset_ordered() {
        let mut body = loop_body();
        // Insert an external call before the loop exit's ret.
        body.instructions[11] = call("ext", "work");
        body.instructions.push(Opcode::Ret);
        let options = TransformOptions {
            include_external_calls: true,
            ..TransformOptions::default()
        };
        let points = analyze(&body, &options, &HashSet::new()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].id, 0);
        assert_eq!(points[0].offset, 10);
        assert_eq!(points[1].id, 1);
        assert_eq!(points[1].offset, 11);
        assert_eq!(points[1].kind, YieldPointKind::ExternalCall);
    }

    #[test]
    fn internal_assemblies_are_trusted() {
        let mut body = loop_body();
        body.instructions[11] = call("home", "work");
        body.instructions.push(Opcode::Ret);
        let options = TransformOptions {
            include_external_calls: true,
            internal_assemblies: ["home".to_string()].into_iter().collect(),
            ..TransformOptions::default()
        };
        let points = analyze(&body, &options, &HashSet::new()).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].kind, YieldPointKind::BackwardBranch);
    }

    #[test]
    fn continuable_call_sites_get_a_point_even_when_external_checks_are_off() {
        let mut body = loop_body();
        body.instructions[11] = call("home", "nested");
        body.instructions.push(Opcode::Ret);
        let token = MethodRef {
            assembly: AssemblyId::new("home"),
            type_name: "T".into(),
            method_name: "nested".into(),
            param_types: vec![],
            return_type: None,
        }
        .token();
        let options = TransformOptions {
            include_external_calls: false,
            ..TransformOptions::default()
        };
        let points = analyze(&body, &options, &[token].into_iter().collect()).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].kind, YieldPointKind::ExternalCall);
    }

    #[test]
    fn disabled_backward_branches_drop_loop_points() {
        let options = TransformOptions {
            include_backward_branches: false,
            ..TransformOptions::default()
        };
        let points = analyze(&loop_body(), &options, &HashSet::new()).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn finally_region_yield_is_a_static_error() {
        // Loop placed inside a finally handler region.
        let mut body = loop_body();
        body.handlers.push(HandlerRegion {
            try_start: 0,
            try_end: 1,
            handler_start: 2,
            handler_end: 11,
            kind: HandlerKind::Finally,
        });
        let err = analyze(&body, &TransformOptions::default(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, AnalysisError::YieldInFinally { offset: 10 }));
    }
}
