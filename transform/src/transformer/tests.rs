use std::collections::HashSet;

use molt_types::bytecode::{
    AssemblyId, Intrinsic, MethodDef, MethodRef, MethodSig, Opcode,
};
use molt_types::descriptor::{DescriptorCatalog, SlotKind};
use molt_types::{HandlerKind, LocalVar, MethodBody, TypeSig};

use super::*;
use crate::error::{AnalysisError, TransformError};

/// `int count_to(int n) { int i = 0; while (i < n) i = i + 1; return i; }`
fn count_to_method() -> MethodDef {
    MethodDef {
        name: "count_to".into(),
        signature: MethodSig {
            params: vec![TypeSig::I32],
            ret: Some(TypeSig::I32),
        },
        attributes: vec!["Continuable".into()],
        is_abstract: false,
        body: Some(MethodBody {
            locals: vec![LocalVar::named("i", TypeSig::I32)],
            handlers: vec![],
            instructions: vec![
                Opcode::LdcI4(0),
                Opcode::StLoc(0),
                Opcode::LdLoc(0),
                Opcode::LdArg(0),
                Opcode::Clt,
                Opcode::BrFalse(11),
                Opcode::LdLoc(0),
                Opcode::LdcI4(1),
                Opcode::Add,
                Opcode::StLoc(0),
                Opcode::Br(2),
                Opcode::LdLoc(0),
                Opcode::Ret,
            ],
        }),
    }
}

fn transform(method: &mut MethodDef) -> (TransformOutcome, DescriptorCatalog) {
    let mut catalog = DescriptorCatalog::new();
    let outcome = transform_method(
        "Demo.Counter",
        method,
        &TransformOptions::default(),
        &HashSet::new(),
        &mut catalog,
    )
    .expect("transform");
    (outcome, catalog)
}

#[test]
fn prologue_is_spliced_in_forward_order() {
    let mut method = count_to_method();
    let (outcome, _) = transform(&mut method);
    assert!(outcome.was_transformed());

    let body = method.body.as_ref().unwrap();
    // ctx is the first synthetic local after the single original.
    assert_eq!(body.instructions[0], Opcode::CallIntrinsic(Intrinsic::LoadContext));
    assert_eq!(body.instructions[1], Opcode::StLoc(1));
    assert_eq!(body.instructions[2], Opcode::LdLoc(1));
    assert!(matches!(
        body.instructions[3],
        Opcode::CallIntrinsic(Intrinsic::BeginRestore { .. })
    ));
}

#[test]
fn dispatch_targets_the_poll_of_each_yield_point() {
    let mut method = count_to_method();
    let (_, _) = transform(&mut method);
    let body = method.body.as_ref().unwrap();

    let targets = body
        .instructions
        .iter()
        .find_map(|op| match op {
            Opcode::Switch(targets) => Some(targets.clone()),
            _ => None,
        })
        .expect("dispatch table");
    assert_eq!(targets.len(), 1);

    // Each dispatch target lands on the poll: load ctx, push the id, then
    // invoke the budgeted check (back edge under instruction counting).
    let at = targets[0];
    assert_eq!(body.instructions[at], Opcode::LdLoc(1));
    assert_eq!(body.instructions[at + 1], Opcode::LdcI4(0));
    assert_eq!(body.instructions[at + 2], Opcode::LdcI4(1));
    assert_eq!(
        body.instructions[at + 3],
        Opcode::CallIntrinsic(Intrinsic::HandleYieldPointWithBudget)
    );
}

#[test]
fn loop_branch_is_redirected_through_the_check() {
    let mut method = count_to_method();
    let (_, _) = transform(&mut method);
    let body = method.body.as_ref().unwrap();

    // The back-edge branch still exists and its own offset sits after the
    // injected check; the check prefix begins with the state-tag store.
    let (branch_at, target) = body
        .instructions
        .iter()
        .enumerate()
        .find_map(|(i, op)| match op {
            Opcode::Br(t) => Some((i, *t)),
            _ => None,
        })
        .expect("loop branch");
    // Walking forward from the branch target must reach the branch again
    // without leaving the loop: the check lies between them.
    assert!(target < branch_at);
    let prefix_at = branch_at - 6;
    assert_eq!(body.instructions[prefix_at], Opcode::LdcI4(0));
    assert_eq!(body.instructions[prefix_at + 1], Opcode::StLoc(3));
}

#[test]
fn capture_handler_wraps_the_rewritten_body() {
    let mut method = count_to_method();
    let (_, _) = transform(&mut method);
    let body = method.body.as_ref().unwrap();

    let capture = body
        .handlers
        .iter()
        .find(|h| h.kind == HandlerKind::CatchSuspend)
        .expect("capture clause");
    // The prologue sits outside the protected region.
    assert!(capture.try_start > 0);
    assert_eq!(body.instructions[capture.handler_start], Opcode::StLoc(4));
    assert_eq!(
        body.instructions[capture.handler_end - 1],
        Opcode::Rethrow
    );
    // Packing allocates one array of exactly argc + original locals.
    assert_eq!(
        body.instructions[capture.handler_start + 1],
        Opcode::LdcI4(2)
    );
}

#[test]
fn descriptor_records_args_then_locals() {
    let mut method = count_to_method();
    let (outcome, catalog) = transform(&mut method);
    let descriptor = catalog.get(outcome.method_token).expect("descriptor");

    assert_eq!(descriptor.slots().len(), 2);
    assert_eq!(descriptor.slots()[0].kind, SlotKind::Argument);
    assert_eq!(descriptor.slots()[1].kind, SlotKind::Local);
    assert_eq!(descriptor.slots()[1].name.as_deref(), Some("i"));
    assert_eq!(descriptor.yield_point_ids(), &[0]);
    assert_eq!(descriptor.live_count_at(0), Some(2));
    assert_eq!(outcome.spill_temp_count, 0);
}

#[test]
fn methods_without_yield_points_are_untouched() {
    let mut method = MethodDef {
        name: "plain".into(),
        signature: MethodSig::default(),
        attributes: vec![],
        is_abstract: false,
        body: Some(MethodBody {
            locals: vec![],
            handlers: vec![],
            instructions: vec![Opcode::Nop, Opcode::Ret],
        }),
    };
    let before = method.body.clone();
    let mut catalog = DescriptorCatalog::new();
    let outcome = transform_method(
        "T",
        &mut method,
        &TransformOptions::default(),
        &HashSet::new(),
        &mut catalog,
    )
    .unwrap();
    assert!(!outcome.was_transformed());
    assert_eq!(method.body, before);
    assert!(catalog.is_empty());
}

#[test]
fn analysis_failure_leaves_the_method_unchanged() {
    // Join at 3 is reached with depth 0 and depth 1, and the method loops so
    // a yield point exists.
    let mut method = MethodDef {
        name: "broken".into(),
        signature: MethodSig::default(),
        attributes: vec![],
        is_abstract: false,
        body: Some(MethodBody {
            locals: vec![],
            handlers: vec![],
            instructions: vec![
                Opcode::LdcBool(true),
                Opcode::BrTrue(3),
                Opcode::LdcI4(5),
                Opcode::Ret,
            ],
        }),
    };
    let before = method.body.clone();
    let mut catalog = DescriptorCatalog::new();
    let err = transform_method(
        "T",
        &mut method,
        &TransformOptions::default(),
        &HashSet::new(),
        &mut catalog,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        TransformError::Analysis(AnalysisError::StackDepthMismatch { .. })
    ));
    assert_eq!(method.body, before);
    assert!(catalog.is_empty());
}

#[test]
fn disallowed_opcodes_fail_the_method() {
    let mut method = count_to_method();
    let options = TransformOptions {
        disallowed_opcodes: vec!["clt".to_string()],
        ..TransformOptions::default()
    };
    let mut catalog = DescriptorCatalog::new();
    let err = transform_method(
        "T",
        &mut method,
        &options,
        &HashSet::new(),
        &mut catalog,
    )
    .unwrap_err();
    assert!(matches!(err, TransformError::DisallowedOpcode { .. }));
}

#[test]
fn spilled_call_sites_get_eval_stack_slots() {
    // f(1 + 2) with the argument already on the stack at the call.
    let mut method = MethodDef {
        name: "spiller".into(),
        signature: MethodSig::default(),
        attributes: vec![],
        is_abstract: false,
        body: Some(MethodBody {
            locals: vec![],
            handlers: vec![],
            instructions: vec![
                Opcode::LdcI4(1),
                Opcode::LdcI4(2),
                Opcode::Add,
                Opcode::Call(MethodRef {
                    assembly: AssemblyId::new("elsewhere"),
                    type_name: "Ext".into(),
                    method_name: "f".into(),
                    param_types: vec![TypeSig::I32],
                    return_type: None,
                }),
                Opcode::Ret,
            ],
        }),
    };
    let options = TransformOptions {
        include_external_calls: true,
        ..TransformOptions::default()
    };
    let mut catalog = DescriptorCatalog::new();
    let outcome = transform_method(
        "T",
        &mut method,
        &options,
        &HashSet::new(),
        &mut catalog,
    )
    .unwrap();
    assert_eq!(outcome.yield_point_count, 1);
    assert_eq!(outcome.spill_temp_count, 1);

    let descriptor = catalog.get(outcome.method_token).unwrap();
    assert_eq!(descriptor.slots().len(), 1);
    assert_eq!(descriptor.slots()[0].kind, SlotKind::EvalStack);
    assert_eq!(descriptor.live_count_at(0), Some(1));

    // The spill store/reload brackets the poll.
    let body = method.body.as_ref().unwrap();
    let poll = body
        .instructions
        .iter()
        .position(|op| matches!(op, Opcode::CallIntrinsic(Intrinsic::HandleYieldPoint)))
        .expect("poll");
    assert!(matches!(body.instructions[poll - 3], Opcode::StLoc(_)));
    assert!(matches!(body.instructions[poll + 1], Opcode::LdLoc(_)));
}
