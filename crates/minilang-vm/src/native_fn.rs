//! Wrapper for builtins implemented directly in Rust rather than as a
//! compiled closure or a bespoke [`State`] machine.
//!
//! Most of the standard-library surface (`list`, `tuple`,
//! `count`, …) is a thin, effectively-synchronous operation; wrapping
//! them as `NativeFn` avoids hand-writing a one-shot state machine for
//! each. Combinators whose contract genuinely spans suspension points
//! (`iterate`-driven adapters, `task`, `tasks`, `parallel`, `buffered`)
//! are real `State` implementations instead (see `iterate.rs`,
//! `combinators.rs`, `task.rs`).

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use minilang_core::value::NativeValue;
use minilang_core::Value;

use crate::state::{Context, StateRef, Step};

pub type NativeFnBody = dyn Fn(StateRef, &Context, Vec<Value>) -> Step;

pub struct NativeFn {
    pub name: &'static str,
    pub body: Box<NativeFnBody>,
}

impl NativeFn {
    pub fn new(name: &'static str, body: impl Fn(StateRef, &Context, Vec<Value>) -> Step + 'static) -> Value {
        Value::Native(Rc::new(NativeFn {
            name,
            body: Box::new(body),
        }))
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

impl NativeValue for NativeFn {
    fn type_name(&self) -> &'static str {
        "function"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RootState;

    #[test]
    fn native_fn_invokes_its_body() {
        let f = NativeFn::new("double", |caller, _ctx, args| {
            let Value::Int(i) = args[0] else { unreachable!() };
            Step::TailCall(caller, Value::Int(i * 2))
        });
        let Value::Native(n) = &f else { unreachable!() };
        let body = &n.downcast_ref::<NativeFn>().unwrap().body;
        let root = RootState::new();
        let ctx = Context::new();
        match (body)(root.clone(), &ctx, vec![Value::Int(4)]) {
            Step::TailCall(_, Value::Int(8)) => {}
            _ => panic!("expected doubled result"),
        }
    }
}
