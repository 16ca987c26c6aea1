use std::cell::Cell;
use std::rc::Rc;

use molt_runtime::{
    machine_entry, EntryFn, EntryPointRegistry, RuntimeError, Runner, Unwind,
};
use molt_transform::{rewrite_assembly, TransformOptions};
use molt_types::bytecode::{
    Assembly, AssemblyId, MethodBody, MethodDef, MethodSig, Module, Opcode, TypeDef,
};
use molt_types::descriptor::DescriptorCatalog;
use molt_types::{LocalVar, TypeSig, Value};

use super::Scheduler;
use crate::events::SchedulerEvent;
use crate::task::TaskState;

fn count_to_assembly() -> (Rc<Assembly>, i32, Rc<EntryPointRegistry>) {
    let mut asm = Assembly {
        name: AssemblyId::new("demo"),
        modules: vec![Module {
            name: "main".into(),
            types: vec![TypeDef {
                name: "Demo.Counter".into(),
                attributes: vec![],
                nested: vec![],
                methods: vec![MethodDef {
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
                }],
            }],
        }],
    };
    let mut catalog = DescriptorCatalog::new();
    rewrite_assembly(&mut asm, &TransformOptions::default(), &mut catalog).unwrap();
    let token = asm.modules[0].types[0].methods[0].token("Demo.Counter");
    let asm = Rc::new(asm);
    let mut registry = EntryPointRegistry::new();
    registry.publish_assembly(&asm, &catalog).unwrap();
    (asm, token, Rc::new(registry))
}

fn scheduler_with(budget: i64) -> (Scheduler, Rc<Assembly>, i32) {
    let (asm, token, registry) = count_to_assembly();
    (
        Scheduler::with_budget_per_slice(Runner::new(registry), budget),
        asm,
        token,
    )
}

fn immediate(value: Value) -> EntryFn {
    Rc::new(move |_| Ok(value.clone()))
}

#[test]
fn small_tasks_complete_in_one_tick() {
    let (mut sched, asm, token) = scheduler_with(100);
    let id = sched.add_task("counter", 1, machine_entry(asm, token, vec![Value::I32(9)]));
    sched.run();
    let task = sched.task(id).unwrap();
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(task.result(), Some(&Value::I32(9)));
    assert_eq!(task.yield_count(), 0);
}

#[test]
fn long_tasks_yield_and_finish_across_ticks() {
    let (mut sched, asm, token) = scheduler_with(3);
    let id = sched.add_task("counter", 1, machine_entry(asm, token, vec![Value::I32(10)]));
    sched.run();
    let task = sched.task(id).unwrap();
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(task.result(), Some(&Value::I32(10)));
    assert_eq!(task.yield_count(), 4);
}

#[test]
fn failed_tasks_keep_their_error_and_leave_the_queue() {
    let (mut sched, _, _) = scheduler_with(10);
    let entry: EntryFn = Rc::new(|_| {
        Err(Unwind::Fault(RuntimeError::Argument("broken task".into())))
    });
    let id = sched.add_task("broken", 1, entry);
    sched.run();
    let task = sched.task(id).unwrap();
    assert_eq!(task.state(), TaskState::Failed);
    assert!(matches!(task.error(), Some(RuntimeError::Argument(_))));
    // No residual queue entries: further ticks do nothing.
    assert!(!sched.tick());
}

#[test]
fn removed_tasks_never_run() {
    let (mut sched, _, _) = scheduler_with(10);
    let invoked = Rc::new(Cell::new(false));
    let witness = Rc::clone(&invoked);
    let entry: EntryFn = Rc::new(move |_| {
        witness.set(true);
        Ok(Value::Null)
    });
    let id = sched.add_task("doomed", 1, entry);
    assert!(sched.remove_task(id));
    sched.tick();
    assert!(!invoked.get());
    assert_eq!(sched.task_count(), 0);
}

#[test]
fn suspended_tasks_wait_until_woken() {
    let (mut sched, asm, token) = scheduler_with(3);
    let id = sched.add_task("parked", 1, machine_entry(asm, token, vec![Value::I32(50)]));
    // One tick: the task yields and re-enqueues.
    sched.tick();
    assert_eq!(sched.task(id).unwrap().state(), TaskState::Suspended);
    assert!(sched.suspend_task(id));
    assert_eq!(sched.task(id).unwrap().state(), TaskState::Waiting);
    // Its queue entries are gone; ticking does not run it.
    let yields_before = sched.task(id).unwrap().yield_count();
    sched.run_for(5);
    assert_eq!(sched.task(id).unwrap().yield_count(), yields_before);
    assert!(sched.wake_task(id));
    assert_eq!(sched.task(id).unwrap().state(), TaskState::Suspended);
    sched.run();
    assert_eq!(sched.task(id).unwrap().state(), TaskState::Completed);
}

#[test]
fn priority_weighting_approaches_the_share_ratio() {
    let (mut sched, asm, token) = scheduler_with(3);
    // Both tasks are effectively endless within 200 ticks.
    let a = sched.add_task(
        "a",
        1,
        machine_entry(Rc::clone(&asm), token, vec![Value::I32(1_000_000)]),
    );
    let b = sched.add_task("b", 3, machine_entry(asm, token, vec![Value::I32(1_000_000)]));
    sched.run_for(200);
    let a_yields = sched.task(a).unwrap().yield_count() as f64;
    let b_yields = sched.task(b).unwrap().yield_count() as f64;
    let ratio = b_yields / a_yields;
    assert!(
        (2.7..=3.3).contains(&ratio),
        "ratio {ratio} outside 3x +-10% ({a_yields} vs {b_yields})"
    );
}

#[test]
fn consumed_budget_tracks_the_observed_decrement() {
    let (mut sched, asm, token) = scheduler_with(5);
    let id = sched.add_task("meter", 1, machine_entry(asm, token, vec![Value::I32(1_000)]));
    sched.run_for(3);
    // Every slice drains the full budget while the loop is hot.
    assert_eq!(sched.task(id).unwrap().consumed_budget(), 15);
}

#[test]
fn stop_before_run_returns_promptly() {
    let (mut sched, _, _) = scheduler_with(10);
    let invoked = Rc::new(Cell::new(false));
    let witness = Rc::clone(&invoked);
    let entry: EntryFn = Rc::new(move |_| {
        witness.set(true);
        Ok(Value::Null)
    });
    sched.add_task("later", 1, entry);
    sched.stop();
    sched.run();
    assert!(!invoked.get());
    // The latch clears: a second run proceeds.
    sched.run();
    assert!(invoked.get());
}

#[test]
fn events_fire_in_transition_order() {
    let (mut sched, asm, token) = scheduler_with(3);
    let log = Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    sched.on_event(Box::new(move |event| {
        sink.borrow_mut().push(match event {
            SchedulerEvent::TaskStateChanged {
                previous, current, ..
            } => format!("{previous}->{current}"),
            SchedulerEvent::TaskYielded { .. } => "yielded".to_string(),
            SchedulerEvent::TaskCompleted { .. } => "completed".to_string(),
            SchedulerEvent::TaskFailed { .. } => "failed".to_string(),
        });
    }));
    sched.add_task("observed", 1, machine_entry(asm, token, vec![Value::I32(4)]));
    sched.run();
    let log = log.borrow();
    assert_eq!(log[0], "ready->running");
    assert_eq!(log[1], "running->suspended");
    assert_eq!(log[2], "yielded");
    assert!(log.contains(&"completed".to_string()));
    let completed_at = log.iter().position(|e| e == "completed").unwrap();
    assert_eq!(log[completed_at - 1], "running->completed");
}

#[test]
fn priorities_below_one_are_clamped() {
    let (mut sched, _, _) = scheduler_with(10);
    let id = sched.add_task("weightless", 0, immediate(Value::Null));
    assert_eq!(sched.task(id).unwrap().priority(), 1);
}
