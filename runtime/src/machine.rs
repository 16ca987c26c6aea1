//! The bytecode machine.
//!
//! A small operand-stack evaluator over [`MethodBody`] instructions. Nested
//! calls recurse through the host stack, so an unwinding suspend signal
//! bubbles outward as the distinguished `Unwind::Suspend` result; each
//! transformed frame's capture clause intercepts it, prepends its record and
//! re-raises. Only `CatchSuspend` regions see suspensions; user catch-alls
//! observe thrown values, never the signal.
//!
//! Finally regions are analyzed statically (no yield point may sit inside
//! one) and execute only on the normal path; the machine does not run them
//! while unwinding.

use std::collections::HashMap;
use std::rc::Rc;

use log::trace;
use molt_types::bytecode::{Assembly, MethodBody, MethodDef, MethodSig, Opcode};
use molt_types::{FrameRecord, Intrinsic, SuspendSignal, TypeSig, Value};

use crate::context::TaskContext;
use crate::error::{RuntimeError, Unwind};
use crate::slots;

/// Host-stack recursion cap for nested calls.
pub const MAX_CALL_DEPTH: usize = 256;

/// Executes method bodies from one assembly.
pub struct Machine<'a> {
    index: HashMap<i32, (&'a str, &'a MethodDef)>,
    max_call_depth: usize,
}

/// What the machine is unwinding with inside a handler.
enum Caught {
    Signal(Rc<SuspendSignal>),
    Thrown(Value),
}

enum Next {
    Advance,
    Jump(usize),
    Return(Value),
}

impl<'a> Machine<'a> {
    pub fn new(assembly: &'a Assembly) -> Self {
        let mut index = HashMap::new();
        for module in &assembly.modules {
            for ty in &module.types {
                index_type(ty, &mut index);
            }
        }
        Machine {
            index,
            max_call_depth: MAX_CALL_DEPTH,
        }
    }

    /// Invokes the method with `token`, `args` positional.
    pub fn invoke(
        &self,
        token: i32,
        args: Vec<Value>,
        ctx: &Rc<TaskContext>,
    ) -> Result<Value, Unwind> {
        self.invoke_at_depth(token, args, ctx, 0)
    }

    fn invoke_at_depth(
        &self,
        token: i32,
        args: Vec<Value>,
        ctx: &Rc<TaskContext>,
        depth: usize,
    ) -> Result<Value, Unwind> {
        if depth >= self.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded {
                max: self.max_call_depth,
            }
            .into());
        }
        let (type_name, method) = self
            .index
            .get(&token)
            .copied()
            .ok_or(RuntimeError::UnknownMethodToken(token))?;
        let body = method
            .body
            .as_ref()
            .ok_or(RuntimeError::UnknownMethodToken(token))?;
        if args.len() != method.signature.params.len() {
            return Err(RuntimeError::Argument(format!(
                "{type_name}::{} expects {} argument(s), got {}",
                method.name,
                method.signature.params.len(),
                args.len()
            ))
            .into());
        }
        trace!("invoke {type_name}::{} at depth {depth}", method.name);
        self.exec(body, &method.signature, args, ctx, depth)
    }

    fn exec(
        &self,
        body: &MethodBody,
        sig: &MethodSig,
        mut args: Vec<Value>,
        ctx: &Rc<TaskContext>,
        depth: usize,
    ) -> Result<Value, Unwind> {
        let mut locals: Vec<Value> = body
            .locals
            .iter()
            .map(|local| Value::default_of(&local.ty))
            .collect();
        let mut stack: Vec<Value> = Vec::new();
        let mut caught: Option<Caught> = None;
        let mut pc: usize = 0;

        loop {
            let op = body.instructions.get(pc).ok_or(RuntimeError::InvalidProgram {
                offset: pc,
                reason: "control fell off the end".to_string(),
            })?;
            let step = self.step(op, pc, &mut stack, &mut locals, &mut args, sig, ctx, depth, &caught);
            match step {
                Ok(Next::Advance) => pc += 1,
                Ok(Next::Jump(target)) => pc = target,
                Ok(Next::Return(value)) => return Ok(value),
                Err(unwind) => match find_handler(body, pc, &unwind) {
                    Some((handler_start, caught_kind, caught_value)) => {
                        stack.clear();
                        stack.push(caught_value);
                        caught = Some(caught_kind);
                        pc = handler_start;
                    }
                    None => return Err(unwind),
                },
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step(
        &self,
        op: &Opcode,
        pc: usize,
        stack: &mut Vec<Value>,
        locals: &mut [Value],
        args: &mut [Value],
        sig: &MethodSig,
        ctx: &Rc<TaskContext>,
        depth: usize,
        caught: &Option<Caught>,
    ) -> Result<Next, Unwind> {
        let underflow = || RuntimeError::InvalidProgram {
            offset: pc,
            reason: "operand stack underflow".to_string(),
        };
        macro_rules! pop {
            () => {
                stack.pop().ok_or_else(underflow)?
            };
        }

        match op {
            Opcode::Nop => {}
            Opcode::LdNull => stack.push(Value::Null),
            Opcode::LdcBool(v) => stack.push(Value::Bool(*v)),
            Opcode::LdcI4(v) => stack.push(Value::I32(*v)),
            Opcode::LdcI8(v) => stack.push(Value::I64(*v)),
            Opcode::LdcR8(v) => stack.push(Value::F64(*v)),
            Opcode::LdStr(s) => stack.push(Value::str(s.clone())),
            Opcode::LdLoc(index) => {
                let value = locals
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| bad_index(pc, "local", *index))?;
                stack.push(value);
            }
            Opcode::StLoc(index) => {
                let value = pop!();
                let slot = locals
                    .get_mut(*index as usize)
                    .ok_or_else(|| bad_index(pc, "local", *index))?;
                *slot = value;
            }
            Opcode::LdArg(index) => {
                let value = args
                    .get(*index as usize)
                    .cloned()
                    .ok_or_else(|| bad_index(pc, "argument", *index))?;
                stack.push(value);
            }
            Opcode::StArg(index) => {
                let value = pop!();
                let slot = args
                    .get_mut(*index as usize)
                    .ok_or_else(|| bad_index(pc, "argument", *index))?;
                *slot = value;
            }
            Opcode::Dup => {
                let value = pop!();
                stack.push(value.clone());
                stack.push(value);
            }
            Opcode::Pop => {
                pop!();
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem => {
                let rhs = pop!();
                let lhs = pop!();
                stack.push(arith(op, lhs, rhs, pc)?);
            }
            Opcode::Neg => {
                let value = pop!();
                let negated = match value {
                    Value::I32(v) => Value::I32(v.wrapping_neg()),
                    Value::I64(v) => Value::I64(v.wrapping_neg()),
                    Value::F64(v) => Value::F64(-v),
                    other => return Err(numeric_mismatch(&other).into()),
                };
                stack.push(negated);
            }
            Opcode::Ceq => {
                let rhs = pop!();
                let lhs = pop!();
                stack.push(Value::Bool(lhs == rhs));
            }
            Opcode::Clt | Opcode::Cgt => {
                let rhs = pop!();
                let lhs = pop!();
                stack.push(compare(op, lhs, rhs)?);
            }
            Opcode::Br(target) => return Ok(Next::Jump(*target)),
            Opcode::BrTrue(target) => {
                let value = pop!();
                if value.is_truthy() {
                    return Ok(Next::Jump(*target));
                }
            }
            Opcode::BrFalse(target) => {
                let value = pop!();
                if !value.is_truthy() {
                    return Ok(Next::Jump(*target));
                }
            }
            Opcode::Switch(targets) => {
                let value = pop!();
                if let Value::I32(v) = value {
                    if v >= 0 && (v as usize) < targets.len() {
                        return Ok(Next::Jump(targets[v as usize]));
                    }
                } else {
                    return Err(numeric_mismatch(&value).into());
                }
            }
            Opcode::Ret => {
                let value = if sig.ret.is_some() {
                    pop!()
                } else {
                    Value::Null
                };
                return Ok(Next::Return(value));
            }
            Opcode::Throw => {
                let value = pop!();
                return Err(RuntimeError::UserThrow(value).into());
            }
            Opcode::Rethrow => {
                return Err(match caught {
                    Some(Caught::Signal(signal)) => Unwind::Suspend(Rc::clone(signal)),
                    Some(Caught::Thrown(value)) => {
                        RuntimeError::UserThrow(value.clone()).into()
                    }
                    None => RuntimeError::InvalidProgram {
                        offset: pc,
                        reason: "rethrow outside a handler".to_string(),
                    }
                    .into(),
                });
            }
            Opcode::Call(mref) => {
                let mut call_args = Vec::with_capacity(mref.param_types.len());
                for _ in 0..mref.param_types.len() {
                    call_args.push(pop!());
                }
                call_args.reverse();
                let result = self.invoke_at_depth(mref.token(), call_args, ctx, depth + 1)?;
                if mref.return_type.is_some() {
                    stack.push(result);
                }
            }
            Opcode::CallIntrinsic(intrinsic) => {
                self.exec_intrinsic(intrinsic, stack, ctx, pc)?;
            }
            Opcode::NewArr(elem) => {
                let len = pop_i32(stack, pc)?;
                if len < 0 {
                    return Err(RuntimeError::Argument(format!(
                        "array length {len} is negative"
                    ))
                    .into());
                }
                stack.push(Value::array(elem.clone(), vec![Value::Null; len as usize]));
            }
            Opcode::LdElem => {
                let index = pop_i32(stack, pc)?;
                let array = pop_array(stack, pc)?;
                let value = array
                    .borrow()
                    .items
                    .get(index_usize(index)?)
                    .cloned()
                    .ok_or_else(|| element_range(index, array.borrow().items.len()))?;
                stack.push(value);
            }
            Opcode::StElem => {
                let value = pop!();
                let index = pop_i32(stack, pc)?;
                let array = pop_array(stack, pc)?;
                let len = array.borrow().items.len();
                *array
                    .borrow_mut()
                    .items
                    .get_mut(index_usize(index)?)
                    .ok_or_else(|| element_range(index, len))? = value;
            }
            Opcode::LdLen => {
                let array = pop_array(stack, pc)?;
                let len = array.borrow().items.len();
                stack.push(Value::I32(len as i32));
            }
            Opcode::Box(ty) | Opcode::Unbox(ty) => {
                let value = pop!();
                stack.push(slots::coerce(value, ty)?);
            }
        }
        Ok(Next::Advance)
    }

    fn exec_intrinsic(
        &self,
        intrinsic: &Intrinsic,
        stack: &mut Vec<Value>,
        ctx: &Rc<TaskContext>,
        pc: usize,
    ) -> Result<(), Unwind> {
        match intrinsic {
            Intrinsic::LoadContext => {
                stack.push(Value::I64(ctx.context_id() as i64));
            }
            Intrinsic::HandleYieldPoint => {
                let id = pop_i32(stack, pc)?;
                pop_context_handle(stack, ctx, pc)?;
                ctx.handle_yield_point(id).map_err(Unwind::Suspend)?;
            }
            Intrinsic::HandleYieldPointWithBudget => {
                let cost = pop_i32(stack, pc)?;
                let id = pop_i32(stack, pc)?;
                pop_context_handle(stack, ctx, pc)?;
                ctx.handle_yield_point_with_budget(id, i64::from(cost))
                    .map_err(Unwind::Suspend)?;
            }
            Intrinsic::BeginRestore { method_token } => {
                pop_context_handle(stack, ctx, pc)?;
                let popped = if ctx.is_restoring() {
                    match ctx.frame_chain() {
                        Some(head) if head.borrow().method_token == *method_token => {
                            ctx.set_frame_chain(head.borrow().caller.clone());
                            if ctx.frame_chain().is_none() {
                                ctx.set_restoring(false);
                            }
                            Some(head)
                        }
                        _ => None,
                    }
                } else {
                    None
                };
                stack.push(popped.map_or(Value::Null, Value::Frame));
            }
            Intrinsic::FrameYieldPointId => {
                let frame = pop_frame(stack, pc)?;
                let id = frame.borrow().yield_point_id;
                stack.push(Value::I32(id));
            }
            Intrinsic::FrameSlot => {
                let index = pop_i32(stack, pc)?;
                let frame = pop_frame(stack, pc)?;
                let value = slots::unpack(&frame.borrow().slots, index, &TypeSig::Any)?;
                stack.push(value);
            }
            Intrinsic::NewFrameRecord { method_token } => {
                let yield_point_id = pop_i32(stack, pc)?;
                let signal = pop_signal(stack, pc)?;
                let array = pop_array(stack, pc)?;
                let packed = slots::pack(&array.borrow().items);
                let record =
                    FrameRecord::new(*method_token, yield_point_id, packed, signal.frame_chain());
                stack.push(Value::Frame(record));
            }
            Intrinsic::SetFrameChain => {
                let frame = pop_frame(stack, pc)?;
                let signal = pop_signal(stack, pc)?;
                signal.set_frame_chain(Some(frame));
            }
            Intrinsic::ResumeValue => {
                stack.push(ctx.take_resume_value());
            }
            Intrinsic::YieldWith => {
                let value = stack.pop().ok_or(RuntimeError::InvalidProgram {
                    offset: pc,
                    reason: "operand stack underflow".to_string(),
                })?;
                return Err(Unwind::Suspend(SuspendSignal::new(0, value)));
            }
        }
        Ok(())
    }
}

fn index_type<'a>(ty: &'a molt_types::TypeDef, index: &mut HashMap<i32, (&'a str, &'a MethodDef)>) {
    for method in &ty.methods {
        index.insert(method.token(&ty.name), (ty.name.as_str(), method));
    }
    for nested in &ty.nested {
        index_type(nested, index);
    }
}

fn find_handler(
    body: &MethodBody,
    pc: usize,
    unwind: &Unwind,
) -> Option<(usize, Caught, Value)> {
    for region in &body.handlers {
        if !region.protects(pc) {
            continue;
        }
        match (region.kind, unwind) {
            (molt_types::HandlerKind::CatchSuspend, Unwind::Suspend(signal)) => {
                return Some((
                    region.handler_start,
                    Caught::Signal(Rc::clone(signal)),
                    Value::Signal(Rc::clone(signal)),
                ));
            }
            (molt_types::HandlerKind::CatchAny, Unwind::Fault(RuntimeError::UserThrow(value))) => {
                return Some((
                    region.handler_start,
                    Caught::Thrown(value.clone()),
                    value.clone(),
                ));
            }
            _ => {}
        }
    }
    None
}

fn arith(op: &Opcode, lhs: Value, rhs: Value, pc: usize) -> Result<Value, RuntimeError> {
    match (lhs, rhs) {
        (Value::I32(a), Value::I32(b)) => int_arith(op, i64::from(a), i64::from(b), pc)
            .map(|v| Value::I32(v as i32)),
        (Value::I64(a), Value::I64(b)) => int_arith(op, a, b, pc).map(Value::I64),
        (Value::F64(a), Value::F64(b)) => Ok(Value::F64(match op {
            Opcode::Add => a + b,
            Opcode::Sub => a - b,
            Opcode::Mul => a * b,
            Opcode::Div => a / b,
            Opcode::Rem => a % b,
            _ => unreachable!(),
        })),
        (lhs, _) => Err(numeric_mismatch(&lhs)),
    }
}

fn int_arith(op: &Opcode, a: i64, b: i64, _pc: usize) -> Result<i64, RuntimeError> {
    match op {
        Opcode::Add => Ok(a.wrapping_add(b)),
        Opcode::Sub => Ok(a.wrapping_sub(b)),
        Opcode::Mul => Ok(a.wrapping_mul(b)),
        Opcode::Div | Opcode::Rem => {
            if b == 0 {
                return Err(RuntimeError::Arithmetic("division by zero".to_string()));
            }
            Ok(if matches!(op, Opcode::Div) {
                a.wrapping_div(b)
            } else {
                a.wrapping_rem(b)
            })
        }
        _ => unreachable!(),
    }
}

fn compare(op: &Opcode, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    let less = matches!(op, Opcode::Clt);
    let result = match (&lhs, &rhs) {
        (Value::I32(a), Value::I32(b)) => {
            if less {
                a < b
            } else {
                a > b
            }
        }
        (Value::I64(a), Value::I64(b)) => {
            if less {
                a < b
            } else {
                a > b
            }
        }
        (Value::F64(a), Value::F64(b)) => {
            if less {
                a < b
            } else {
                a > b
            }
        }
        _ => return Err(numeric_mismatch(&lhs)),
    };
    Ok(Value::Bool(result))
}

fn numeric_mismatch(value: &Value) -> RuntimeError {
    RuntimeError::TypeMismatch {
        expected: "numeric".to_string(),
        observed: value.kind_name().to_string(),
    }
}

fn bad_index(pc: usize, what: &str, index: u16) -> RuntimeError {
    RuntimeError::InvalidProgram {
        offset: pc,
        reason: format!("{what} index {index} out of range"),
    }
}

fn element_range(index: i32, len: usize) -> RuntimeError {
    RuntimeError::Argument(format!("element index {index} out of range for {len}"))
}

fn index_usize(index: i32) -> Result<usize, RuntimeError> {
    usize::try_from(index)
        .map_err(|_| RuntimeError::Argument(format!("element index {index} is negative")))
}

fn pop_i32(stack: &mut Vec<Value>, pc: usize) -> Result<i32, RuntimeError> {
    match stack.pop() {
        Some(Value::I32(v)) => Ok(v),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "int".to_string(),
            observed: other.kind_name().to_string(),
        }),
        None => Err(RuntimeError::InvalidProgram {
            offset: pc,
            reason: "operand stack underflow".to_string(),
        }),
    }
}

fn pop_array(
    stack: &mut Vec<Value>,
    pc: usize,
) -> Result<Rc<std::cell::RefCell<molt_types::ValueArray>>, RuntimeError> {
    match stack.pop() {
        Some(Value::Array(array)) => Ok(array),
        Some(Value::Null) => Err(RuntimeError::Argument("array is null".to_string())),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "array".to_string(),
            observed: other.kind_name().to_string(),
        }),
        None => Err(RuntimeError::InvalidProgram {
            offset: pc,
            reason: "operand stack underflow".to_string(),
        }),
    }
}

fn pop_frame(
    stack: &mut Vec<Value>,
    pc: usize,
) -> Result<molt_types::FrameRef, RuntimeError> {
    match stack.pop() {
        Some(Value::Frame(frame)) => Ok(frame),
        Some(Value::Null) => Err(RuntimeError::Argument("frame record is null".to_string())),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "frame-record".to_string(),
            observed: other.kind_name().to_string(),
        }),
        None => Err(RuntimeError::InvalidProgram {
            offset: pc,
            reason: "operand stack underflow".to_string(),
        }),
    }
}

fn pop_signal(stack: &mut Vec<Value>, pc: usize) -> Result<Rc<SuspendSignal>, RuntimeError> {
    match stack.pop() {
        Some(Value::Signal(signal)) => Ok(signal),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "suspend-signal".to_string(),
            observed: other.kind_name().to_string(),
        }),
        None => Err(RuntimeError::InvalidProgram {
            offset: pc,
            reason: "operand stack underflow".to_string(),
        }),
    }
}

fn pop_context_handle(
    stack: &mut Vec<Value>,
    ctx: &Rc<TaskContext>,
    pc: usize,
) -> Result<(), RuntimeError> {
    match stack.pop() {
        Some(Value::I64(handle)) if handle as u64 == ctx.context_id() => Ok(()),
        Some(Value::I64(handle)) => Err(RuntimeError::Argument(format!(
            "context handle {handle} does not match the installed context"
        ))),
        Some(other) => Err(RuntimeError::TypeMismatch {
            expected: "context handle".to_string(),
            observed: other.kind_name().to_string(),
        }),
        None => Err(RuntimeError::InvalidProgram {
            offset: pc,
            reason: "operand stack underflow".to_string(),
        }),
    }
}
