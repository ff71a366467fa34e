//! The bytecode dispatch loop: `step` re-enters a [`Frame`] at its
//! stored instruction and runs until the frame either calls out to
//! another [`State`] (and returns the `Step` that continues it), hands
//! its result to its caller (`RETURN`/tail `CALL`), or parks as a
//! suspension.
//!
//! Every handler below follows the same three-part discipline the data
//! model calls for: deref a value before a user-observable use of it,
//! check for a propagating error before any effect, then perform the
//! effect and advance.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use minilang_core::error::{kinds, raise};
use minilang_core::value::NativeValue;
use minilang_core::{UninitializedSlot, Value};

use crate::closure::Closure;
use crate::dispatch::{assign_value, call_value, deref_value};
use crate::frame::{Frame, Suspension};
use crate::iterate::{iterate_value, key_value, next_value, value_value};
use crate::opcode::{Opcode, Params, UpvalueSource};
use crate::state::{Context, Step};

/// Re-enters `frame` with `value` as the freshly-arrived result (the
/// return from whatever the frame last called out to, or the initial
/// argument on a fresh call). Loops over successive instructions inline
/// whenever a handler completes synchronously, only returning a `Step`
/// when control genuinely passes to another `State`.
pub fn step(frame: Rc<Frame>, ctx: &Context, value: Value) -> Step {
    let mut result = value;
    loop {
        let inst = frame.inst.borrow().clone();

        if result.is_error() && !matches!(inst.op, Opcode::Catch) {
            if let Value::Error(e) = &result {
                e.borrow_mut().add_trace(frame.source.as_ref(), inst.line);
            }
            match frame.on_error.borrow_mut().take() {
                Some(handler) => {
                    *frame.inst.borrow_mut() = handler;
                    continue;
                }
                None => return Step::TailCall(frame.caller(), result),
            }
        }

        match inst.op {
            Opcode::Nil => {
                result = Value::Nil;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::Some => {
                result = Value::Some;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::Load => {
                let Params::InstValue(succ, v) = &inst.params else { unreachable!("LOAD") };
                result = v.clone();
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Push => {
                frame.push(result.clone());
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::Pop => {
                frame.pop();
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::With => {
                frame.push(result.clone());
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::WithVar => {
                frame.push(Value::reference(result.clone()));
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::WithX => {
                let Params::InstCount(succ, n) = &inst.params else { unreachable!("WITHX") };
                match unpack(&result, *n) {
                    Ok(items) => {
                        for item in items {
                            frame.push(item);
                        }
                        *frame.inst.borrow_mut() = succ.clone();
                    }
                    Err(err) => result = err,
                }
            }
            Opcode::Enter => {
                let Params::InstIndexCount(succ, locals, uninit) = &inst.params else { unreachable!("ENTER") };
                for _ in 0..*locals {
                    frame.push(Value::reference(Value::Nil));
                }
                for _ in 0..*uninit {
                    frame.push(Value::Uninitialized(Rc::new(RefCell::new(UninitializedSlot::default()))));
                }
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Exit => {
                let Params::InstCount(succ, n) = &inst.params else { unreachable!("EXIT") };
                let base = frame.top_len().saturating_sub(*n as usize);
                frame.truncate(base);
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Loop | Opcode::Else => {
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::If => {
                let Params::InstPair(taken, not_taken) = &inst.params else { unreachable!("IF") };
                *frame.inst.borrow_mut() = if result.is_truthy() { taken.clone() } else { not_taken.clone() };
            }
            Opcode::Try => {
                let Params::InstPair(succ, handler) = &inst.params else { unreachable!("TRY") };
                *frame.on_error.borrow_mut() = Some(handler.clone());
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Catch => {
                let Params::InstIndex(succ, base) = &inst.params else { unreachable!("CATCH") };
                if !result.is_error() {
                    return Step::TailCall(
                        frame.caller(),
                        raise(kinds::INTERNAL_ERROR, "catch opcode without error on result"),
                    );
                }
                if let Value::Error(e) = &result {
                    e.borrow_mut().caught = true;
                }
                frame.truncate(*base as usize);
                frame.push(result.clone());
                result = Value::Nil;
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Local => {
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("LOCAL") };
                result = frame.local(*i);
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::LocalX => {
                // `ENTER` already materializes every forward-referenceable
                // slot as `Uninitialized` up front, so reading one here
                // needs no further lazy allocation.
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("LOCALX") };
                result = frame.local(*i);
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Upvalue => {
                // A captured cell reads as a reference, so writes through
                // one closure stay visible through its siblings.
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("UPVALUE") };
                result = Value::Reference(frame.upvalue(*i));
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Var => {
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("VAR") };
                let slot = frame.local(*i);
                result = assign_value(&slot, deref_value(&result));
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::VarX => {
                let Params::InstIndexCount(succ, i, n) = &inst.params else { unreachable!("VARX") };
                match unpack(&result, *n) {
                    Ok(items) => {
                        for (k, item) in items.into_iter().enumerate() {
                            assign_value(&frame.local(*i + k as u32), item);
                        }
                        *frame.inst.borrow_mut() = succ.clone();
                    }
                    Err(err) => result = err,
                }
            }
            Opcode::Let => {
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("LET") };
                frame.set_local(*i, result.clone());
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::LetI => {
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("LETI") };
                resolve_forward_reference(&frame.local(*i), &result);
                frame.set_local(*i, result.clone());
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::LetX => {
                let Params::InstIndexCount(succ, i, n) = &inst.params else { unreachable!("LETX") };
                match unpack(&result, *n) {
                    Ok(items) => {
                        for (k, item) in items.into_iter().enumerate() {
                            let slot = *i + k as u32;
                            resolve_forward_reference(&frame.local(slot), &item);
                            frame.set_local(slot, item);
                        }
                        *frame.inst.borrow_mut() = succ.clone();
                    }
                    Err(err) => result = err,
                }
            }
            Opcode::For => {
                *frame.inst.borrow_mut() = inst.successor();
                let seq = deref_value(&result);
                if let Value::Native(n) = &seq {
                    if n.downcast_ref::<crate::task::Buffered>().is_some() {
                        return crate::task::start_buffered(frame, ctx, seq);
                    }
                }
                return iterate_value(frame, ctx, seq);
            }
            Opcode::Next => {
                *frame.inst.borrow_mut() = inst.successor();
                let iter = deref_value(&result);
                if let Value::Native(n) = &iter {
                    if n.downcast_ref::<crate::iterate::RepeatedCursor>().is_some() {
                        return crate::iterate::advance_repeated(frame, ctx, iter);
                    }
                    if n.downcast_ref::<crate::task::BufferedCursor>().is_some() {
                        return crate::task::advance_buffered(frame, ctx, iter);
                    }
                    // A generator's next position is produced by resuming
                    // the suspended frame: it runs to its next SUSPEND
                    // (another suspension) or its RETURN (nil).
                    if n.downcast_ref::<Suspension>().is_some() {
                        return call_value(frame, ctx, iter, Vec::new());
                    }
                }
                return next_value(frame, ctx, iter);
            }
            Opcode::Value => {
                *frame.inst.borrow_mut() = inst.successor();
                return value_value(frame, ctx, deref_value(&result));
            }
            Opcode::Key => {
                *frame.inst.borrow_mut() = inst.successor();
                return key_value(frame, ctx, deref_value(&result));
            }
            Opcode::Call => {
                let Params::InstCount(succ, n) = &inst.params else { unreachable!("CALL") };
                let args = pop_n(&frame, *n);
                let callee = deref_value(&result);
                *frame.inst.borrow_mut() = succ.clone();
                return call_value(frame, ctx, callee, args);
            }
            Opcode::ConstCall => {
                let Params::InstCountValue(succ, n, callee) = &inst.params else { unreachable!("CONST_CALL") };
                let args = pop_n(&frame, *n);
                let callee = callee.clone();
                *frame.inst.borrow_mut() = succ.clone();
                return call_value(frame, ctx, callee, args);
            }
            Opcode::TailCall => {
                let Params::Count(n) = &inst.params else { unreachable!("TAIL_CALL") };
                let args = pop_n(&frame, *n);
                let callee = deref_value(&result);
                return call_value(frame.caller(), ctx, callee, args);
            }
            Opcode::Assign => {
                let reference = frame.pop();
                result = assign_value(&reference, deref_value(&result));
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::TupleNew => {
                let Params::InstCount(succ, n) = &inst.params else { unreachable!("TUPLE_NEW") };
                let builder = TupleBuilder::new(*n);
                frame.push(builder.clone());
                result = builder;
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::TupleSet => {
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("TUPLE_SET") };
                result = set_builder_slot::<TupleBuilder>(&frame, *i, deref_value(&result))
                    .unwrap_or_else(|| raise(kinds::TYPE_ERROR, "TUPLE_SET without a tuple builder"));
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::ListNew => {
                let value = Value::List(Rc::new(RefCell::new(minilang_core::List::new())));
                frame.push(value.clone());
                result = value;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::ListAppend => {
                let list_value = frame.pop();
                if let Value::List(list) = &list_value {
                    list.borrow_mut().push_back(deref_value(&result));
                }
                frame.push(list_value.clone());
                result = list_value;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::MapNew => {
                let value = Value::Map(Rc::new(RefCell::new(minilang_core::Map::new())));
                frame.push(value.clone());
                result = value;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::MapInsert => {
                let key = deref_value(&frame.pop());
                let map_value = frame.pop();
                if let Value::Map(map) = &map_value {
                    map.borrow_mut().insert(key, deref_value(&result));
                }
                frame.push(map_value.clone());
                result = map_value;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::PartialNew => {
                let Params::InstCount(succ, n) = &inst.params else { unreachable!("PARTIAL_NEW") };
                let builder = Value::Native(Rc::new(Partial {
                    target: deref_value(&result),
                    bound: RefCell::new(vec![Value::Nil; *n as usize]),
                }));
                frame.push(builder.clone());
                result = builder;
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::PartialSet => {
                let Params::InstIndex(succ, i) = &inst.params else { unreachable!("PARTIAL_SET") };
                let builder = frame.pop();
                if let Value::Native(n) = &builder {
                    if let Some(p) = n.downcast_ref::<Partial>() {
                        p.bound.borrow_mut()[*i as usize] = deref_value(&result);
                    }
                }
                frame.push(builder.clone());
                result = builder;
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::StringNew => {
                let value = Value::StringBuffer(Rc::new(RefCell::new(minilang_core::StringBuffer::new())));
                frame.push(value.clone());
                result = value;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::StringAdd => {
                let buffer_value = frame.pop();
                if let Value::StringBuffer(buf) = &buffer_value {
                    match deref_value(&result) {
                        Value::Str(s) => buf.borrow_mut().push_str(&s),
                        other => buf.borrow_mut().push_str(&other.to_string()),
                    }
                }
                frame.push(buffer_value.clone());
                result = buffer_value;
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::StringEnd => {
                let buffer_value = frame.pop();
                result = match &buffer_value {
                    Value::StringBuffer(buf) => Value::string(buf.borrow().to_string_lossy()),
                    _ => raise(kinds::TYPE_ERROR, "STRING_END without a string buffer"),
                };
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::Switch => {
                let Params::Switch(table) = &inst.params else { unreachable!("SWITCH") };
                let Value::Int(i) = deref_value(&result) else {
                    result = raise(kinds::TYPE_ERROR, "switch selector must be an integer");
                    continue;
                };
                match table.get(i as usize) {
                    Some(target) => *frame.inst.borrow_mut() = target.clone(),
                    None => result = raise(kinds::RANGE_ERROR, "switch selector out of range"),
                }
            }
            Opcode::Closure => {
                let Params::ClosureInfo(succ, info, sources) = &inst.params else { unreachable!("CLOSURE") };
                let upvalues = sources.iter().map(|source| capture_upvalue(&frame, *source)).collect();
                result = Value::Native(Rc::new(Closure { info: info.clone(), upvalues }));
                *frame.inst.borrow_mut() = succ.clone();
            }
            Opcode::Suspend => {
                let Params::Inst(resume) = &inst.params else { unreachable!("SUSPEND") };
                *frame.inst.borrow_mut() = resume.clone();
                return Step::TailCall(frame.caller(), Value::Native(Rc::new(Suspension(frame.clone()))));
            }
            Opcode::Resume => {
                frame.pop();
                *frame.inst.borrow_mut() = inst.successor();
            }
            Opcode::Return => {
                return Step::TailCall(frame.caller(), result);
            }
        }
    }
}

fn pop_n(frame: &Rc<Frame>, n: u32) -> Vec<Value> {
    let mut stack = frame.stack.borrow_mut();
    let base = stack.len().saturating_sub(n as usize);
    stack.split_off(base)
}

/// Splits a tuple or list into exactly `n` values for `WITHX`/`VARX`/
/// `LETX`'s unpack protocol; a non-unpackable source is a `TypeError`
/// and a wrong arity a `ValueError`, matching the error kinds for
/// "failed unpack source" / "failed unpack arity".
fn unpack(value: &Value, n: u32) -> Result<Vec<Value>, Value> {
    match deref_value(value) {
        Value::Tuple(items) => {
            if items.len() == n as usize {
                Ok(items.to_vec())
            } else {
                Err(raise(kinds::VALUE_ERROR, format!("expected {n} values, got {}", items.len())))
            }
        }
        Value::List(list) => {
            let items: Vec<Value> = list.borrow().iter_values().collect();
            if items.len() == n as usize {
                Ok(items)
            } else {
                Err(raise(kinds::VALUE_ERROR, format!("expected {n} values, got {}", items.len())))
            }
        }
        other => Err(raise(kinds::TYPE_ERROR, format!("{} is not unpackable", other.type_name()))),
    }
}

/// If `slot` is still an unresolved forward reference, patches every
/// cell that captured it (closures that closed over the not-yet-defined
/// name) to `resolved`, matching `LETI`'s contract.
fn resolve_forward_reference(slot: &Value, resolved: &Value) {
    if let Value::Uninitialized(cell) = slot {
        let mut pending = cell.borrow_mut();
        pending.resolved = Some(resolved.clone());
        for patch in pending.patches.drain(..) {
            *patch.borrow_mut() = resolved.clone();
        }
    }
}

/// Builds the upvalue cell for one `CLOSURE` capture. A `var` slot (or
/// an already-captured upvalue) shares its existing cell directly so
/// writes through one closure are visible through another; an
/// unresolved forward reference gets a fresh cell that is also
/// registered as a patch target so a later `LETI` updates it; anything
/// else is captured by value in a fresh cell.
fn capture_upvalue(frame: &Rc<Frame>, source: UpvalueSource) -> Rc<RefCell<Value>> {
    match source {
        UpvalueSource::Upvalue(i) => frame.upvalue(i),
        UpvalueSource::Local(i) => match frame.local(i) {
            Value::Reference(cell) => cell,
            Value::Uninitialized(slot) => {
                let cell = Rc::new(RefCell::new(Value::Uninitialized(slot.clone())));
                slot.borrow_mut().patches.push(cell.clone());
                cell
            }
            other => Rc::new(RefCell::new(other)),
        },
    }
}

/// Scratch container for `TUPLE_NEW`/`TUPLE_SET`: a tuple is an
/// immutable fixed-arity slice, so it is assembled in a mutable builder
/// first and only converted to the real `Value::Tuple` once its last
/// slot is set.
#[derive(Debug)]
struct TupleBuilder {
    items: RefCell<Vec<Value>>,
    len: u32,
}

impl TupleBuilder {
    fn new(len: u32) -> Value {
        Value::Native(Rc::new(TupleBuilder { items: RefCell::new(vec![Value::Nil; len as usize]), len }))
    }
}

impl NativeValue for TupleBuilder {
    fn type_name(&self) -> &'static str {
        "tuple-builder"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared shape for `TUPLE_SET`/`PARTIAL_SET`-style "peek the stack top,
/// mutate slot `i`, finalize if that was the last slot" steps. Only
/// `TupleBuilder` finalizes into a different value; `PARTIAL_SET` stays
/// the same native value throughout, so it mutates `Partial` directly at
/// its own call site instead of going through this helper.
fn set_builder_slot<T>(frame: &Rc<Frame>, i: u32, value: Value) -> Option<Value>
where
    T: 'static,
{
    let builder = frame.pop();
    let Value::Native(n) = &builder else { return None };
    let tuple_builder = n.downcast_ref::<TupleBuilder>()?;
    tuple_builder.items.borrow_mut()[i as usize] = value;
    if i + 1 == tuple_builder.len {
        let finished = Value::tuple(tuple_builder.items.borrow().clone());
        frame.push(finished.clone());
        Some(finished)
    } else {
        frame.push(builder.clone());
        Some(builder)
    }
}

/// A closure-like value with some leading arguments already bound
/// (`PARTIAL_NEW`/`PARTIAL_SET`): calling it appends the caller's
/// arguments after the bound ones and forwards to `target`.
pub struct Partial {
    pub target: Value,
    pub bound: RefCell<Vec<Value>>,
}

impl fmt::Debug for Partial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<partial>")
    }
}

impl NativeValue for Partial {
    fn type_name(&self) -> &'static str {
        "partial"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}
