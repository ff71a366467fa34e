//! Closures: immutable closure-info shared by every instance, plus the
//! per-instance captured upvalue cells.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use minilang_core::value::NativeValue;
use minilang_core::Value;

use crate::opcode::Inst;

/// Shared, immutable: entry point, frame layout, and arity. One
/// `ClosureInfo` may back many `Closure` instances (one per capture).
pub struct ClosureInfo {
    pub entry: Rc<Inst>,
    pub frame_size: u32,
    pub arity: u32,
    pub upvalue_count: u32,
    pub source: Rc<str>,
    /// Parameter names in positional order, present only when the
    /// closure was built to accept keyword arguments (the in-band `Names`
    /// convention needs somewhere to resolve a label to a slot).
    /// Closures compiled without keyword parameters leave this `None`
    /// and reject any `Names` marker in their call arguments.
    pub param_names: Option<Rc<[Rc<str>]>>,
}

impl fmt::Debug for ClosureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureInfo")
            .field("frame_size", &self.frame_size)
            .field("arity", &self.arity)
            .field("upvalue_count", &self.upvalue_count)
            .field("source", &self.source)
            .finish()
    }
}

/// A callable value: closure-info plus the upvalue cells captured at the
/// `CLOSURE` instruction that built it. Upvalues may be shared across
/// sibling closures that captured the same enclosing local.
#[derive(Debug)]
pub struct Closure {
    pub info: Rc<ClosureInfo>,
    pub upvalues: Vec<Rc<RefCell<Value>>>,
}

impl NativeValue for Closure {
    fn type_name(&self) -> &'static str {
        "closure"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{Opcode, Params};

    #[test]
    fn closure_info_is_shared_across_instances() {
        let entry = Inst::new(Opcode::Return, Params::None, 1);
        let info = Rc::new(ClosureInfo {
            entry,
            frame_size: 0,
            arity: 0,
            upvalue_count: 1,
            source: "test".into(),
            param_names: None,
        });
        let cell = Rc::new(RefCell::new(Value::Int(1)));
        let a = Closure {
            info: info.clone(),
            upvalues: vec![cell.clone()],
        };
        let b = Closure {
            info: info.clone(),
            upvalues: vec![cell.clone()],
        };
        *cell.borrow_mut() = Value::Int(2);
        match (&a.upvalues[0], &b.upvalues[0]) {
            (x, y) => assert!(Rc::ptr_eq(x, y)),
        }
        assert_eq!(Rc::strong_count(&info), 3);
    }
}
