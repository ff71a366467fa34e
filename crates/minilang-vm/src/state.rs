//! The continuation protocol and the scheduler it suspends into.
//!
//! Every operation that may not complete synchronously takes a `caller`
//! state and must eventually invoke `caller.run(value)` exactly once.
//! [`State::run`] returns a [`Step`] instead of recursing directly into
//! the caller: [`drive`] trampolines `Step::TailCall` in a loop so a long
//! chain of synchronous completions (a tight `for` loop, a deep `fold`)
//! never grows the Rust call stack, matching the design note on scheduler
//! trampolining.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use minilang_core::Value;

/// A resumable computation. `run` is the sole resumption entry: a
/// frame re-enters the interpreter at its stored instruction; a native
/// combinator advances its own state machine.
pub trait State {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step;
}

pub type StateRef = Rc<dyn State>;

/// What a `State::run` call produces: either a further synchronous
/// transition to trampoline, or nothing more to do on this call chain
/// (the computation suspended — e.g. registered itself as a task waiter —
/// and some later event will resume it by scheduling a fresh chain).
pub enum Step {
    TailCall(StateRef, Value),
    Parked,
}

/// Runs `state.run(value)`, trampolining every `TailCall` inline, until
/// the chain parks. This is what every suspension point, and every
/// scheduler drain, ultimately calls.
pub fn drive(ctx: &Context, mut state: StateRef, mut value: Value) {
    loop {
        match state.run(ctx, value) {
            Step::TailCall(next, v) => {
                state = next;
                value = v;
            }
            Step::Parked => return,
        }
    }
}

/// `schedule(state, value)` will eventually invoke `state.run(value)`;
/// ordering is FIFO-by-submission within a context. It is legal for
/// an implementation to run inline instead of deferring — callers must
/// assume either, so nothing here relies on deferral for correctness.
pub trait Scheduler {
    fn schedule(&self, state: StateRef, value: Value);
}

/// The default, and only, scheduler this crate ships: a single-threaded
/// FIFO queue drained by [`FifoScheduler::run_until_empty`]. Parallelism
/// is expressed entirely by how many states are queued, never by
/// operating-system threads.
#[derive(Default)]
pub struct FifoScheduler {
    queue: RefCell<VecDeque<(StateRef, Value)>>,
}

impl FifoScheduler {
    pub fn new() -> Rc<Self> {
        Rc::new(FifoScheduler::default())
    }

    /// Drains the queue, driving each entry to completion (or to its next
    /// park point) before moving to the next. New entries scheduled while
    /// draining are processed in the same pass, preserving submission
    /// order.
    pub fn run_until_empty(&self, ctx: &Context) {
        loop {
            let next = self.queue.borrow_mut().pop_front();
            match next {
                Some((state, value)) => drive(ctx, state, value),
                None => return,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl Scheduler for FifoScheduler {
    fn schedule(&self, state: StateRef, value: Value) {
        tracing::trace!("scheduling state for later resumption");
        self.queue.borrow_mut().push_back((state, value));
    }
}

/// Shared execution context threaded through every `State::run` call:
/// the scheduler every suspension resumes through, and the typed-function
/// side table builtins consult for per-type overrides (the data model's
/// `Context` field on a state).
pub struct Context {
    pub scheduler: Rc<FifoScheduler>,
    pub registry: RefCell<minilang_core::TypeRegistry>,
}

impl Context {
    pub fn new() -> Self {
        let ctx = Context {
            scheduler: FifoScheduler::new(),
            registry: RefCell::new(minilang_core::TypeRegistry::new()),
        };
        crate::install_typed_fns(&ctx);
        ctx
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

/// A terminal state that records whatever value it's run with and parks.
/// Used as the top-level "return to host" continuation: the root of a
/// call chain that isn't itself resuming anything.
pub struct RootState {
    pub result: RefCell<Option<Value>>,
}

impl RootState {
    pub fn new() -> Rc<Self> {
        Rc::new(RootState {
            result: RefCell::new(None),
        })
    }
}

impl State for RootState {
    fn run(self: Rc<Self>, _ctx: &Context, value: Value) -> Step {
        *self.result.borrow_mut() = Some(value);
        Step::Parked
    }
}

/// Starts a computation against a fresh root continuation and drives it
/// to completion, returning its result. `build` receives the root and
/// produces the first `Step` (typically a `call_value`). Used by
/// builtins whose contract is synchronous (a `sort` comparator), and
/// panics if the computation parks without ever reaching the root,
/// which a caller of `run_sync` has promised won't happen.
pub fn run_sync(ctx: &Context, build: impl FnOnce(StateRef) -> Step) -> Value {
    let root = RootState::new();
    match build(root.clone()) {
        Step::TailCall(state, value) => drive(ctx, state, value),
        Step::Parked => {}
    }
    root.result
        .borrow_mut()
        .take()
        .expect("run_sync: computation suspended instead of completing")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_trampolines_without_recursing() {
        let ctx = Context::new();
        let root = RootState::new();
        drive(&ctx, root.clone(), Value::Int(7));
        assert!(matches!(root.result.borrow().as_ref(), Some(Value::Int(7))));
    }

    #[test]
    fn scheduler_runs_fifo() {
        let ctx = Context::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        struct Record(Rc<RefCell<Vec<i64>>>);
        impl State for Record {
            fn run(self: Rc<Self>, _ctx: &Context, value: Value) -> Step {
                if let Value::Int(i) = value {
                    self.0.borrow_mut().push(i);
                }
                Step::Parked
            }
        }

        ctx.scheduler.schedule(Rc::new(Record(order.clone())), Value::Int(1));
        ctx.scheduler.schedule(Rc::new(Record(order.clone())), Value::Int(2));
        ctx.scheduler.run_until_empty(&ctx);
        assert_eq!(*order.borrow(), vec![1, 2]);
    }
}
