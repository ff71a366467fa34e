//! Minilang's bytecode interpreter: the CPS continuation protocol, the
//! opcode dispatch loop, and the cooperative concurrency and sequence
//! primitives built on top of it.
//!
//! # Modules
//!
//! - `state`: the `State`/`Step`/`Context` continuation protocol and the
//!   FIFO scheduler every suspension resumes through.
//! - `opcode`: the closed bytecode instruction set.
//! - `frame`: the activation record `interpreter::step` re-enters.
//! - `interpreter`: the opcode dispatch loop itself.
//! - `closure`: closure-info and per-instance upvalue capture.
//! - `dispatch`: polymorphic `call`/`deref`/`assign` across value kinds.
//! - `mapnode`: the assignable `map[key]` node handle.
//! - `native_fn`: the wrapper for builtins implemented directly in Rust.
//! - `iterate`: the four-call iteration protocol and its adapters.
//! - `combinators`: sequence reducers (`all`, `map`, `count`, `fold`, ...).
//! - `task`: `task`/`tasks` cooperative concurrency primitives.
//! - `class`: classes and instances.
//! - `builtins`: the standard-library surface registered as native values.

pub mod builtins;
pub mod class;
pub mod closure;
pub mod combinators;
pub mod dispatch;
pub mod frame;
pub mod interpreter;
pub mod iterate;
pub mod mapnode;
pub mod native_fn;
pub mod opcode;
pub mod state;
pub mod task;

pub use closure::{Closure, ClosureInfo};
pub use dispatch::{assign_value, call_value, deref_value};
pub use frame::Frame;
pub use opcode::{Inst, Opcode, Params};
pub use state::{Context, State, StateRef, Step};

/// The per-type operation overrides installed at context startup, after
/// types exist and before any globals reference them. One entry so far:
/// `count` on a buffered sequence forwards to the underlying sequence
/// instead of running the pipeline, since buffering never changes how
/// many pairs come out.
pub(crate) fn install_typed_fns(ctx: &Context) {
    use combinators::TypedSeqFn;
    ctx.registry.borrow_mut().attach(
        "buffered",
        "count",
        std::rc::Rc::new(TypedSeqFn(Box::new(|ctx, caller, seq| {
            let minilang_core::Value::Native(n) = &seq else {
                unreachable!("registered for the buffered type only");
            };
            let inner = n
                .downcast_ref::<task::Buffered>()
                .expect("registered for the buffered type only")
                .inner();
            combinators::count(ctx, caller, inner)
        }))),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_context_starts_with_an_empty_scheduler() {
        let ctx = Context::new();
        assert!(ctx.scheduler.is_empty());
    }
}
