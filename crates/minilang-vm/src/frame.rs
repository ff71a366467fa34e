//! The activation record — itself a [`State`], so a suspended frame
//! is simply a value the scheduler can resume later.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use minilang_core::value::NativeValue;
use minilang_core::Value;

use crate::opcode::Inst;
use crate::state::{Context, State, StateRef, Step};

/// One bytecode function invocation. The frame exclusively owns its
/// stack; upvalues may be shared across sibling closures. The caller is
/// rebindable: resuming a suspension re-parents the frame under whoever
/// called it this time, so the next `SUSPEND`/`RETURN` hands its result
/// to the resumer rather than the original caller.
pub struct Frame {
    pub caller: RefCell<StateRef>,
    pub source: Rc<str>,
    /// The instruction to resume at. Interior-mutable because `run`
    /// receives `&self` through `Rc<Self>`, not `&mut self`.
    pub inst: RefCell<Rc<Inst>>,
    pub on_error: RefCell<Option<Rc<Inst>>>,
    pub stack: RefCell<Vec<Value>>,
    pub upvalues: Vec<Rc<RefCell<Value>>>,
}

impl Frame {
    pub fn new(caller: StateRef, source: Rc<str>, entry: Rc<Inst>, upvalues: Vec<Rc<RefCell<Value>>>) -> Rc<Self> {
        Rc::new(Frame {
            caller: RefCell::new(caller),
            source,
            inst: RefCell::new(entry),
            on_error: RefCell::new(None),
            stack: RefCell::new(Vec::new()),
            upvalues,
        })
    }

    pub fn caller(&self) -> StateRef {
        self.caller.borrow().clone()
    }

    pub fn push(&self, value: Value) {
        self.stack.borrow_mut().push(value);
    }

    pub fn pop(&self) -> Value {
        self.stack
            .borrow_mut()
            .pop()
            .expect("frame stack underflow")
    }

    pub fn top_len(&self) -> usize {
        self.stack.borrow().len()
    }

    pub fn truncate(&self, base: usize) {
        self.stack.borrow_mut().truncate(base);
    }

    pub fn local(&self, index: u32) -> Value {
        self.stack.borrow()[index as usize].clone()
    }

    pub fn set_local(&self, index: u32, value: Value) {
        self.stack.borrow_mut()[index as usize] = value;
    }

    pub fn upvalue(&self, index: u32) -> Rc<RefCell<Value>> {
        self.upvalues[index as usize].clone()
    }

    /// The suspended value: topmost stack slot of a parked frame (the
    /// iteration slot `SUSPEND` leaves for `value` to read).
    pub fn suspended_value(&self) -> Value {
        self.stack.borrow().last().cloned().unwrap_or(Value::Nil)
    }

    /// The suspended key: the slot beneath the value, or `Nil` for a
    /// generator that only pushed a value.
    pub fn suspended_key(&self) -> Value {
        let stack = self.stack.borrow();
        match stack.len() {
            0 | 1 => Value::Nil,
            n => stack[n - 2].clone(),
        }
    }
}

/// What `SUSPEND` hands back to the caller: the parked frame itself,
/// wrapped so it can travel through `Value::Native` and be resumed later
/// by calling it.
pub struct Suspension(pub Rc<Frame>);

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<suspension>")
    }
}

impl NativeValue for Suspension {
    fn type_name(&self) -> &'static str {
        "suspension"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl State for Frame {
    /// Re-enters the interpreter at the frame's stored instruction. This
    /// is the suspension/resumption entry point: a fresh call sets
    /// `inst` to the closure's entry before the frame is ever scheduled;
    /// a resumed suspension already has `inst` pointing past the
    /// `SUSPEND` that parked it.
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        crate::interpreter::step(self, ctx, value)
    }
}
