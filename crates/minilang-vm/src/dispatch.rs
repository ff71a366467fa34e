//! Polymorphic `call`/`deref`/`assign` dispatch: the single place
//! that decides what those type-descriptor operations mean for every
//! kind of value the interpreter or a builtin can produce.
//!
//! `next`/`key`/`value` belong to the iteration protocol and live in
//! `iterate.rs`. `deref`/`assign` are identity/`TypeError` for every
//! value kind except reference cells (handled by `minilang-core`) and
//! map nodes (handled here), so [`deref_value`]/[`assign_value`] are the
//! interpreter's entry points rather than `Value::deref`/`assign`
//! directly. `call` is the operation genuinely shared by closures,
//! native functions, tasks, task sets, classes, maps-as-indexers, and
//! integers-as-indexers, so it gets the bulk of this module.

use std::rc::Rc;

use minilang_core::error::{kinds, raise};
use minilang_core::value::downcast_native_rc;
use minilang_core::Value;

use crate::class::{ClassDef, FieldRef, Instance};
use crate::closure::Closure;
use crate::frame::{Frame, Suspension};
use crate::interpreter::Partial;
use crate::mapnode::MapNode;
use crate::native_fn::NativeFn;
use crate::state::{Context, StateRef, Step};
use crate::task::{Task, TasksSet};

/// Collapses references and map nodes to their underlying value. This is
/// the deref every opcode that consumes a user-observable value goes
/// through; `Value::deref` alone only knows about reference cells.
pub fn deref_value(value: &Value) -> Value {
    if let Value::Native(n) = value {
        if let Some(node) = n.downcast_ref::<MapNode>() {
            return node.deref();
        }
        if let Some(field) = n.downcast_ref::<FieldRef>() {
            return field.deref();
        }
    }
    value.deref()
}

/// Writes through a reference cell, a map node, or an object field;
/// anything else is a `TypeError`. Assigning through a floating map node
/// is what inserts its key.
pub fn assign_value(target: &Value, value: Value) -> Value {
    if let Value::Native(n) = target {
        if let Some(node) = n.downcast_ref::<MapNode>() {
            return node.assign(value);
        }
        if let Some(field) = n.downcast_ref::<FieldRef>() {
            return field.assign(value);
        }
    }
    target.assign(value)
}

/// Splits a call's argument vector at the first `Names` marker, the way
/// every callee that understands keyword arguments must: the in-band
/// convention is `[positional..., Names([n1, n2, ...]), v1, v2, ...]`.
pub struct SplitArgs {
    pub positional: Vec<Value>,
    pub named: Vec<(Rc<str>, Value)>,
}

pub fn split_names(mut args: Vec<Value>) -> SplitArgs {
    if let Some(pos) = args.iter().position(|v| matches!(v, Value::Names(_))) {
        let rest = args.split_off(pos + 1);
        let Value::Names(labels) = args.pop().unwrap() else {
            unreachable!()
        };
        let named = labels.iter().cloned().zip(rest).collect();
        SplitArgs {
            positional: args,
            named,
        }
    } else {
        SplitArgs {
            positional: args,
            named: Vec::new(),
        }
    }
}

/// Invokes `callee(args)` with `caller` as its continuation. Returns the
/// `Step` that continues the interpreter: either a direct `TailCall`
/// (the callee completed, or is itself a frame about to run) or
/// `Step::Parked` (the callee registered `caller` to be resumed later,
/// e.g. an unset `task`).
pub fn call_value(caller: StateRef, ctx: &Context, callee: Value, args: Vec<Value>) -> Step {
    let callee = deref_value(&callee);
    if callee.is_error() {
        return Step::TailCall(caller, callee);
    }
    match &callee {
        Value::Int(i) => call_integer_indexer(caller, *i, args),
        Value::Map(map) => call_map_indexer(caller, ctx, map.clone(), args),
        Value::Native(native) => {
            if let Some(closure) = native.downcast_ref::<Closure>() {
                call_closure(caller, closure, args)
            } else if let Some(native_fn) = native.downcast_ref::<NativeFn>() {
                (native_fn.body)(caller, ctx, args)
            } else if let Some(task) = native.downcast_ref::<Task>() {
                task.call(ctx, caller)
            } else if native.downcast_ref::<TasksSet>().is_some() {
                let tasks = downcast_native_rc::<TasksSet>(native.clone()).expect("checked above");
                tasks.call(ctx, caller, args)
            } else if native.downcast_ref::<ClassDef>().is_some() {
                let class = downcast_native_rc::<ClassDef>(native.clone()).expect("checked above");
                Step::TailCall(caller, class.instantiate(args))
            } else if native.downcast_ref::<Instance>().is_some() {
                let instance = downcast_native_rc::<Instance>(native.clone()).expect("checked above");
                call_instance_field(caller, instance, args)
            } else if let Some(suspension) = native.downcast_ref::<Suspension>() {
                // Resuming re-parents the frozen frame under this caller,
                // so the next SUSPEND/RETURN resumes the resumer.
                let frame = suspension.0.clone();
                *frame.caller.borrow_mut() = caller;
                Step::TailCall(frame as StateRef, args.into_iter().next().unwrap_or(Value::Nil))
            } else if let Some(partial) = native.downcast_ref::<Partial>() {
                let mut full = partial.bound.borrow().clone();
                full.extend(args);
                call_value(caller, ctx, partial.target.clone(), full)
            } else {
                Step::TailCall(
                    caller,
                    raise(kinds::TYPE_ERROR, format!("{} is not callable", callee.type_name())),
                )
            }
        }
        other => Step::TailCall(
            caller,
            raise(kinds::TYPE_ERROR, format!("{} is not callable", other.type_name())),
        ),
    }
}

/// Integer-as-function indexes into its argument list: `i(args...)`
/// returns `args[i-1]` (1-based, matching the data model's "integer may
/// also carry function-call semantics").
fn call_integer_indexer(caller: StateRef, index: i64, mut args: Vec<Value>) -> Step {
    if index < 1 || (index as usize) > args.len() {
        return Step::TailCall(
            caller,
            raise(
                kinds::RANGE_ERROR,
                format!("index {index} out of range for {} arguments", args.len()),
            ),
        );
    }
    let value = deref_value(&args.swap_remove(index as usize - 1));
    Step::TailCall(caller, value)
}

/// `obj(:field)`: the assignable handle for one field slot. Full method
/// dispatch on objects belongs to the external resolver; field access is
/// the one piece the core owns, since instantiation and `with`-scoped
/// field writes depend on it.
fn call_instance_field(caller: StateRef, instance: Rc<Instance>, mut args: Vec<Value>) -> Step {
    if args.len() != 1 {
        return Step::TailCall(
            caller,
            raise(kinds::VALUE_ERROR, format!("field access expects 1 argument, got {}", args.len())),
        );
    }
    let (Value::Symbol(name) | Value::Str(name)) = deref_value(&args.pop().unwrap()) else {
        return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "field name must be a symbol"));
    };
    Step::TailCall(caller, instance.field_ref(&name))
}

/// `map[key]` / `map[key, fn]`: one argument hands back the
/// node for `key` — floating if absent — and two arguments materialize a
/// default via `fn(key)` first.
fn call_map_indexer(
    caller: StateRef,
    ctx: &Context,
    map: Rc<std::cell::RefCell<minilang_core::Map>>,
    mut args: Vec<Value>,
) -> Step {
    match args.len() {
        1 => {
            let key = deref_value(&args.pop().unwrap());
            Step::TailCall(caller, MapNode::new(map, key))
        }
        2 => {
            let default = args.pop().unwrap();
            let key = deref_value(&args.pop().unwrap());
            crate::mapnode::node_or_default(caller, ctx, map, key, default)
        }
        n => Step::TailCall(
            caller,
            raise(kinds::VALUE_ERROR, format!("map index expects 1 or 2 arguments, got {n}")),
        ),
    }
}

/// Builds a fresh frame bound to `closure`'s entry point and `args`, with
/// `caller` as the frame's own caller continuation. Trailing arguments
/// beyond `arity` are dropped; missing trailing arguments default to
/// `Nil`. Keyword arguments are accepted only when the closure's
/// `ClosureInfo` was built with parameter names (hand-assembled test
/// closures and the compiler both opt in this way); otherwise a `Names`
/// marker in the argument list is a `ValueError`.
fn call_closure(caller: StateRef, closure: &Closure, args: Vec<Value>) -> Step {
    let split = split_names(args);
    let mut locals = vec![Value::Nil; closure.info.frame_size as usize];
    let arity = closure.info.arity as usize;
    for (i, value) in split.positional.into_iter().take(arity).enumerate() {
        locals[i] = value;
    }
    if !split.named.is_empty() {
        match &closure.info.param_names {
            Some(names) => {
                for (name, value) in split.named {
                    match names.iter().position(|n| *n == name) {
                        Some(slot) => locals[slot] = value,
                        None => {
                            return Step::TailCall(
                                caller,
                                raise(kinds::VALUE_ERROR, format!("unknown parameter '{name}'")),
                            );
                        }
                    }
                }
            }
            None => {
                return Step::TailCall(
                    caller,
                    raise(kinds::VALUE_ERROR, "closure does not accept keyword arguments"),
                );
            }
        }
    }
    let frame = Frame::new(
        caller,
        closure.info.source.clone(),
        closure.info.entry.clone(),
        closure.upvalues.clone(),
    );
    *frame.stack.borrow_mut() = locals;
    Step::TailCall(frame, Value::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RootState;

    #[test]
    fn integer_indexer_returns_1_based_argument() {
        let root = RootState::new();
        let ctx = Context::new();
        let step = call_value(
            root,
            &ctx,
            Value::Int(2),
            vec![Value::Int(10), Value::Int(20), Value::Int(30)],
        );
        match step {
            Step::TailCall(_, Value::Int(20)) => {}
            _ => panic!("expected args[1]"),
        }
    }

    #[test]
    fn integer_indexer_out_of_range_is_range_error() {
        let root = RootState::new();
        let ctx = Context::new();
        let step = call_value(root, &ctx, Value::Int(5), vec![Value::Int(1)]);
        match step {
            Step::TailCall(_, v) => assert!(v.is_error()),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn split_names_separates_positional_from_keyword() {
        let args = vec![
            Value::Int(1),
            Value::names(vec!["x".into(), "y".into()]),
            Value::Int(2),
            Value::Int(3),
        ];
        let split = split_names(args);
        assert_eq!(split.positional.len(), 1);
        assert_eq!(split.named.len(), 2);
        assert_eq!(split.named[0].0.as_ref(), "x");
    }

    #[test]
    fn calling_non_callable_is_a_type_error() {
        let root = RootState::new();
        let ctx = Context::new();
        let step = call_value(root, &ctx, Value::Str("hi".into()), vec![]);
        match step {
            Step::TailCall(_, v) => assert!(v.is_error()),
            _ => panic!("expected error"),
        }
    }

    #[test]
    fn calling_an_instance_with_a_symbol_yields_a_field_handle() {
        let ctx = Context::new();
        let class = ClassDef::new("point", None, vec!["x".into()]);
        let instance = class.instantiate(vec![Value::Int(4)]);
        let step = call_value(RootState::new(), &ctx, instance, vec![Value::symbol("x")]);
        let Step::TailCall(_, handle) = step else { panic!("expected a field handle") };
        assert!(matches!(deref_value(&handle), Value::Int(4)));
        assign_value(&handle, Value::Int(5));
        assert!(matches!(deref_value(&handle), Value::Int(5)));
    }

    #[test]
    fn calling_a_map_with_a_key_yields_an_assignable_node() {
        let root = RootState::new();
        let ctx = Context::new();
        let map = Rc::new(std::cell::RefCell::new(minilang_core::Map::new()));
        let step = call_value(root, &ctx, Value::Map(map.clone()), vec![Value::symbol("k")]);
        let Step::TailCall(_, node) = step else { panic!("expected a node") };
        assert!(matches!(deref_value(&node), Value::Nil));
        assign_value(&node, Value::Int(8));
        assert_eq!(map.borrow().search(&Value::symbol("k")), Some(Value::Int(8)));
        assert!(matches!(deref_value(&node), Value::Int(8)));
    }
}
