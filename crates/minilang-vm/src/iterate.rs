//! The four-call iteration protocol and its adapters.
//!
//! `iterate`/`next`/`key`/`value` are CPS operations because an
//! embedder-supplied sequence is free to suspend on any of them; in
//! practice the built-in sequence types (`List`, `Map`, `Tuple`,
//! [`Range`]) and the adapters that merely reshape them never need to
//! suspend, so most cursors here advance synchronously and the public
//! `next_value`/`key_value`/`value_value` entry points just wrap the
//! result in a trivially-resolved `Step::TailCall`. The adapters that
//! call a user function per step — `chained`, `repeated`, `grouped` —
//! are genuine `State` machines instead.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use minilang_core::error::{kinds, raise};
use minilang_core::map::Map;
use minilang_core::value::NativeValue;
use minilang_core::Value;

use crate::dispatch::call_value;
use crate::state::{Context, State, StateRef, Step};

/// An integer range, the sequence produced by `a .. b`, inclusive of
/// both ends.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl NativeValue for Range {
    fn type_name(&self) -> &'static str {
        "range"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn range(start: i64, end: i64) -> Value {
    Value::Native(Rc::new(Range { start, end }))
}

#[derive(Debug, Clone)]
struct RangeCursor {
    current: i64,
    end: i64,
    position: i64,
}

impl NativeValue for RangeCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
struct VecCursor {
    items: Rc<Vec<Value>>,
    index: usize,
}

impl NativeValue for VecCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone)]
struct MapCursor {
    entries: Rc<Vec<(Value, Value)>>,
    index: usize,
}

impl NativeValue for MapCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builds the first cursor for any directly-iterable built-in value.
/// Returns `Value::Nil` for an empty sequence, per the protocol.
fn iterate_sync(seq: &Value) -> Value {
    match seq {
        Value::List(list) => {
            let items: Vec<Value> = list.borrow().iter_values().collect();
            if items.is_empty() {
                Value::Nil
            } else {
                Value::Native(Rc::new(VecCursor { items: Rc::new(items), index: 0 }))
            }
        }
        Value::Tuple(items) => {
            if items.is_empty() {
                Value::Nil
            } else {
                Value::Native(Rc::new(VecCursor { items: Rc::new(items.to_vec()), index: 0 }))
            }
        }
        Value::Map(map) => {
            let entries: Vec<(Value, Value)> = map.borrow().iter_insertion_order().collect();
            if entries.is_empty() {
                Value::Nil
            } else {
                Value::Native(Rc::new(MapCursor { entries: Rc::new(entries), index: 0 }))
            }
        }
        Value::Native(n) => {
            if let Some(r) = n.downcast_ref::<Range>() {
                if r.start > r.end {
                    Value::Nil
                } else {
                    Value::Native(Rc::new(RangeCursor { current: r.start, end: r.end, position: 1 }))
                }
            } else if let Some(a) = n.downcast_ref::<Limited>() {
                a.iterate_sync()
            } else if let Some(a) = n.downcast_ref::<Skipped>() {
                a.iterate_sync()
            } else if let Some(a) = n.downcast_ref::<Unique>() {
                a.iterate_sync()
            } else if let Some(a) = n.downcast_ref::<Sequenced>() {
                a.iterate_sync()
            } else if let Some(a) = n.downcast_ref::<Cycled>() {
                a.iterate_sync()
            } else if let Some(a) = n.downcast_ref::<Repeated>() {
                Value::Native(Rc::new(RepeatedCursor { value: a.seed.clone(), f: a.f.clone(), position: 1 }))
            } else if n.downcast_ref::<crate::frame::Suspension>().is_some() {
                // A generator already parked at its first SUSPEND is its
                // own first position.
                seq.clone()
            } else {
                raise(kinds::TYPE_ERROR, format!("{} is not iterable", seq.type_name()))
            }
        }
        other => raise(kinds::TYPE_ERROR, format!("{} is not iterable", other.type_name())),
    }
}

pub fn iterate_value(caller: StateRef, ctx: &Context, seq: Value) -> Step {
    if let Value::Native(n) = &seq {
        if let Some(c) = n.downcast_ref::<Chained>() {
            return start_chained(caller, ctx, iterate_sync(&c.seq), c.stages.clone());
        }
    }
    Step::TailCall(caller, iterate_sync(&seq))
}

/// Advances any cursor this module produces by one step, synchronously.
/// `RepeatedCursor` is the one kind that needs a `Context` (its successor
/// value comes from calling a user function), so it is handled by the
/// `State`-based `repeated` adapter's own entry point instead of here —
/// `advance_sync` only ever sees it nested inside `limited`/`skipped`.
fn advance_sync(iter: &Value) -> Value {
    let Value::Native(n) = iter else {
        return raise(kinds::TYPE_ERROR, "value is not an iterator");
    };
    if let Some(c) = n.downcast_ref::<RangeCursor>() {
        let next = c.current + 1;
        if next > c.end {
            Value::Nil
        } else {
            Value::Native(Rc::new(RangeCursor { current: next, end: c.end, position: c.position + 1 }))
        }
    } else if let Some(c) = n.downcast_ref::<VecCursor>() {
        if c.index + 1 >= c.items.len() {
            Value::Nil
        } else {
            Value::Native(Rc::new(VecCursor { items: c.items.clone(), index: c.index + 1 }))
        }
    } else if let Some(c) = n.downcast_ref::<MapCursor>() {
        if c.index + 1 >= c.entries.len() {
            Value::Nil
        } else {
            Value::Native(Rc::new(MapCursor { entries: c.entries.clone(), index: c.index + 1 }))
        }
    } else if let Some(c) = n.downcast_ref::<LimitedCursor>() {
        c.clone().advance_value()
    } else if let Some(c) = n.downcast_ref::<SkippedCursor>() {
        c.clone().advance_value()
    } else if let Some(c) = n.downcast_ref::<UniqueCursor>() {
        c.clone().advance_value()
    } else if let Some(c) = n.downcast_ref::<SequencedCursor>() {
        c.clone().advance_value()
    } else if let Some(c) = n.downcast_ref::<CycledCursor>() {
        c.clone().advance_value()
    } else {
        raise(kinds::TYPE_ERROR, "value is not an iterator")
    }
}

fn cursor_key(iter: &Value) -> Value {
    let Value::Native(n) = iter else {
        return raise(kinds::TYPE_ERROR, "value is not an iterator");
    };
    if let Some(c) = n.downcast_ref::<RangeCursor>() {
        Value::Int(c.position)
    } else if let Some(c) = n.downcast_ref::<VecCursor>() {
        Value::Int(c.index as i64 + 1)
    } else if let Some(c) = n.downcast_ref::<MapCursor>() {
        c.entries[c.index].0.clone()
    } else if let Some(c) = n.downcast_ref::<LimitedCursor>() {
        cursor_key(&c.inner)
    } else if let Some(c) = n.downcast_ref::<SkippedCursor>() {
        cursor_key(&c.inner)
    } else if let Some(c) = n.downcast_ref::<UniqueCursor>() {
        Value::Int(c.position)
    } else if let Some(c) = n.downcast_ref::<SequencedCursor>() {
        Value::Int(c.position)
    } else if let Some(c) = n.downcast_ref::<CycledCursor>() {
        Value::Int(c.position)
    } else if let Some(c) = n.downcast_ref::<ChainedCursor>() {
        c.key.clone()
    } else if let Some(c) = n.downcast_ref::<RepeatedCursor>() {
        Value::Int(c.position)
    } else if let Some(c) = n.downcast_ref::<crate::task::BufferedCursor>() {
        c.key()
    } else if let Some(s) = n.downcast_ref::<crate::frame::Suspension>() {
        s.0.suspended_key()
    } else {
        raise(kinds::TYPE_ERROR, "value is not an iterator")
    }
}

fn cursor_val(iter: &Value) -> Value {
    let Value::Native(n) = iter else {
        return raise(kinds::TYPE_ERROR, "value is not an iterator");
    };
    if let Some(c) = n.downcast_ref::<RangeCursor>() {
        Value::Int(c.current)
    } else if let Some(c) = n.downcast_ref::<VecCursor>() {
        c.items[c.index].clone()
    } else if let Some(c) = n.downcast_ref::<MapCursor>() {
        c.entries[c.index].1.clone()
    } else if let Some(c) = n.downcast_ref::<LimitedCursor>() {
        cursor_val(&c.inner)
    } else if let Some(c) = n.downcast_ref::<SkippedCursor>() {
        cursor_val(&c.inner)
    } else if let Some(c) = n.downcast_ref::<UniqueCursor>() {
        cursor_val(&c.inner)
    } else if let Some(c) = n.downcast_ref::<SequencedCursor>() {
        cursor_val(&c.inner)
    } else if let Some(c) = n.downcast_ref::<CycledCursor>() {
        cursor_val(&c.inner)
    } else if let Some(c) = n.downcast_ref::<ChainedCursor>() {
        c.value.clone()
    } else if let Some(c) = n.downcast_ref::<RepeatedCursor>() {
        c.value.clone()
    } else if let Some(c) = n.downcast_ref::<crate::task::BufferedCursor>() {
        c.value()
    } else if let Some(s) = n.downcast_ref::<crate::frame::Suspension>() {
        s.0.suspended_value()
    } else {
        raise(kinds::TYPE_ERROR, "value is not an iterator")
    }
}

pub fn next_value(caller: StateRef, ctx: &Context, iter: Value) -> Step {
    if let Value::Native(n) = &iter {
        if let Some(c) = n.downcast_ref::<ChainedCursor>() {
            return start_chained(caller, ctx, advance_sync(&c.inner), c.stages.clone());
        }
    }
    Step::TailCall(caller, advance_sync(&iter))
}

pub fn key_value(caller: StateRef, _ctx: &Context, iter: Value) -> Step {
    Step::TailCall(caller, cursor_key(&iter))
}

pub fn value_value(caller: StateRef, _ctx: &Context, iter: Value) -> Step {
    Step::TailCall(caller, cursor_val(&iter))
}

// ---- limited(seq, n) -------------------------------------------------------

#[derive(Debug)]
pub struct Limited {
    seq: Value,
    n: i64,
}

impl NativeValue for Limited {
    fn type_name(&self) -> &'static str {
        "limited"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Limited {
    fn iterate_sync(&self) -> Value {
        if self.n <= 0 {
            return Value::Nil;
        }
        match iterate_sync(&self.seq) {
            Value::Nil => Value::Nil,
            inner => Value::Native(Rc::new(LimitedCursor { inner, remaining: self.n })),
        }
    }
}

pub fn limited(seq: Value, n: i64) -> Value {
    Value::Native(Rc::new(Limited { seq, n }))
}

#[derive(Debug, Clone)]
struct LimitedCursor {
    inner: Value,
    remaining: i64,
}

impl NativeValue for LimitedCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl LimitedCursor {
    fn advance_value(self) -> Value {
        if self.remaining <= 1 {
            return Value::Nil;
        }
        match advance_sync(&self.inner) {
            Value::Nil => Value::Nil,
            next => Value::Native(Rc::new(LimitedCursor { inner: next, remaining: self.remaining - 1 })),
        }
    }
}

// ---- skipped(seq, n) --------------------------------------------------------

#[derive(Debug)]
pub struct Skipped {
    seq: Value,
    n: i64,
}

impl NativeValue for Skipped {
    fn type_name(&self) -> &'static str {
        "skipped"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Skipped {
    fn iterate_sync(&self) -> Value {
        let mut cur = iterate_sync(&self.seq);
        let mut remaining = self.n;
        while remaining > 0 && !matches!(cur, Value::Nil) {
            cur = advance_sync(&cur);
            remaining -= 1;
        }
        match cur {
            Value::Nil => Value::Nil,
            inner => Value::Native(Rc::new(SkippedCursor { inner })),
        }
    }
}

pub fn skipped(seq: Value, n: i64) -> Value {
    Value::Native(Rc::new(Skipped { seq, n }))
}

#[derive(Debug, Clone)]
struct SkippedCursor {
    inner: Value,
}

impl NativeValue for SkippedCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SkippedCursor {
    fn advance_value(self) -> Value {
        match advance_sync(&self.inner) {
            Value::Nil => Value::Nil,
            inner => Value::Native(Rc::new(SkippedCursor { inner })),
        }
    }
}

// ---- unique(seq) -------------------------------------------------------------

#[derive(Debug)]
pub struct Unique {
    seq: Value,
}

impl NativeValue for Unique {
    fn type_name(&self) -> &'static str {
        "unique"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Unique {
    fn iterate_sync(&self) -> Value {
        let seen = Rc::new(RefCell::new(Map::new()));
        let mut cur = iterate_sync(&self.seq);
        while !matches!(cur, Value::Nil) {
            let v = cursor_val(&cur);
            if seen.borrow_mut().insert(v, Value::Some).is_none() {
                return Value::Native(Rc::new(UniqueCursor { inner: cur, seen, position: 1 }));
            }
            cur = advance_sync(&cur);
        }
        Value::Nil
    }
}

pub fn unique(seq: Value) -> Value {
    Value::Native(Rc::new(Unique { seq }))
}

#[derive(Debug, Clone)]
struct UniqueCursor {
    inner: Value,
    seen: Rc<RefCell<Map>>,
    position: i64,
}

impl NativeValue for UniqueCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl UniqueCursor {
    fn advance_value(self) -> Value {
        let mut cur = advance_sync(&self.inner);
        while !matches!(cur, Value::Nil) {
            let v = cursor_val(&cur);
            if self.seen.borrow_mut().insert(v, Value::Some).is_none() {
                return Value::Native(Rc::new(UniqueCursor {
                    inner: cur,
                    seen: self.seen.clone(),
                    position: self.position + 1,
                }));
            }
            cur = advance_sync(&cur);
        }
        Value::Nil
    }
}

// ---- sequenced(a, b) -----------------------------------------------------

#[derive(Debug)]
pub struct Sequenced {
    first: Value,
    second: Value,
}

impl NativeValue for Sequenced {
    fn type_name(&self) -> &'static str {
        "sequenced"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Sequenced {
    fn iterate_sync(&self) -> Value {
        match iterate_sync(&self.first) {
            Value::Nil => match iterate_sync(&self.second) {
                Value::Nil => Value::Nil,
                inner => Value::Native(Rc::new(SequencedCursor { on_first: false, inner, second: self.second.clone(), position: 1 })),
            },
            inner => Value::Native(Rc::new(SequencedCursor { on_first: true, inner, second: self.second.clone(), position: 1 })),
        }
    }
}

pub fn sequenced(first: Value, second: Value) -> Value {
    Value::Native(Rc::new(Sequenced { first, second }))
}

#[derive(Debug, Clone)]
struct SequencedCursor {
    on_first: bool,
    inner: Value,
    second: Value,
    position: i64,
}

impl NativeValue for SequencedCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl SequencedCursor {
    fn advance_value(self) -> Value {
        if self.on_first {
            match advance_sync(&self.inner) {
                Value::Nil => match iterate_sync(&self.second) {
                    Value::Nil => Value::Nil,
                    inner => Value::Native(Rc::new(SequencedCursor { on_first: false, inner, second: self.second, position: self.position + 1 })),
                },
                inner => Value::Native(Rc::new(SequencedCursor { on_first: true, inner, second: self.second, position: self.position + 1 })),
            }
        } else {
            match advance_sync(&self.inner) {
                Value::Nil => Value::Nil,
                inner => Value::Native(Rc::new(SequencedCursor { on_first: false, inner, second: self.second, position: self.position + 1 })),
            }
        }
    }
}

// ---- chained(seq, stages...) ----------------------------------------------

/// Map/filter stages applied to an underlying producer (the sequence the
/// compiler's `Sequence` constructor builds). Each stage is a function
/// of the current value; a stage returning `Nil` drops the element and
/// the pipeline moves on to the next one. Keys pass through from the
/// underlying sequence unchanged.
pub struct Chained {
    seq: Value,
    stages: Rc<Vec<Value>>,
}

impl fmt::Debug for Chained {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<chained>")
    }
}

impl NativeValue for Chained {
    fn type_name(&self) -> &'static str {
        "chained"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn chained(seq: Value, stages: Vec<Value>) -> Value {
    Value::Native(Rc::new(Chained { seq, stages: Rc::new(stages) }))
}

/// A position with its staged value already computed, so `key`/`value`
/// reads stay synchronous; all the stage calls happen while advancing.
pub struct ChainedCursor {
    inner: Value,
    stages: Rc<Vec<Value>>,
    key: Value,
    value: Value,
}

impl fmt::Debug for ChainedCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<chained-cursor>")
    }
}

impl NativeValue for ChainedCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Runs the stage pipeline for the element at `inner`, skipping filtered
/// elements, until a fully-staged value (a new cursor), exhaustion
/// (nil), or an error arrives at `caller`.
fn start_chained(caller: StateRef, ctx: &Context, inner: Value, stages: Rc<Vec<Value>>) -> Step {
    if matches!(inner, Value::Nil) || inner.is_error() {
        return Step::TailCall(caller, inner);
    }
    let key = cursor_key(&inner);
    let value = cursor_val(&inner);
    let step = Rc::new(ChainedStep {
        caller,
        inner,
        stages,
        key,
        stage_index: RefCell::new(0),
    });
    step.run(ctx, value)
}

struct ChainedStep {
    caller: StateRef,
    inner: Value,
    stages: Rc<Vec<Value>>,
    key: Value,
    stage_index: RefCell<usize>,
}

impl State for ChainedStep {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        if value.is_error() {
            return Step::TailCall(self.caller.clone(), value);
        }
        let index = *self.stage_index.borrow();
        if matches!(value, Value::Nil) && index > 0 {
            // A stage filtered this element out: move to the next one.
            return start_chained(
                self.caller.clone(),
                ctx,
                advance_sync(&self.inner),
                self.stages.clone(),
            );
        }
        let Some(stage) = self.stages.get(index).cloned() else {
            let cursor = Value::Native(Rc::new(ChainedCursor {
                inner: self.inner.clone(),
                stages: self.stages.clone(),
                key: self.key.clone(),
                value,
            }));
            return Step::TailCall(self.caller.clone(), cursor);
        };
        *self.stage_index.borrow_mut() += 1;
        call_value(self, ctx, stage, vec![value])
    }
}

// ---- sequenced(a) ----------------------------------------------------------

/// The unary `sequenced` form: endless self-repetition. Exhausting the
/// sequence starts a fresh traversal; an empty sequence stays empty.
#[derive(Debug)]
pub struct Cycled {
    seq: Value,
}

impl NativeValue for Cycled {
    fn type_name(&self) -> &'static str {
        "sequenced"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Cycled {
    fn iterate_sync(&self) -> Value {
        match iterate_sync(&self.seq) {
            Value::Nil => Value::Nil,
            inner => Value::Native(Rc::new(CycledCursor { seq: self.seq.clone(), inner, position: 1 })),
        }
    }
}

pub fn cycled(seq: Value) -> Value {
    Value::Native(Rc::new(Cycled { seq }))
}

#[derive(Debug, Clone)]
struct CycledCursor {
    seq: Value,
    inner: Value,
    position: i64,
}

impl NativeValue for CycledCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl CycledCursor {
    fn advance_value(self) -> Value {
        let next = match advance_sync(&self.inner) {
            Value::Nil => iterate_sync(&self.seq),
            other => other,
        };
        match next {
            Value::Nil => Value::Nil,
            inner => Value::Native(Rc::new(CycledCursor { seq: self.seq, inner, position: self.position + 1 })),
        }
    }
}

// ---- repeated(v, fn) -------------------------------------------------------

/// Marker recording the seed and stepping function. The actual stepping
/// happens through [`RepeatedCursor`] driven by a caller willing to call
/// `fn` (it may suspend), so `repeated` itself has no special `State`
/// machine — the interpreter's `NEXT` opcode recognizes a `RepeatedCursor`
/// and dispatches straight to [`advance_repeated`] (see `interpreter.rs`),
/// not through `advance_sync`, since `advance_sync` carries no `Context`
/// to call a user function with.
#[derive(Debug)]
pub struct Repeated {
    seed: Value,
    f: Value,
}

impl NativeValue for Repeated {
    fn type_name(&self) -> &'static str {
        "repeated"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub fn repeated(seed: Value, f: Value) -> Value {
    Value::Native(Rc::new(Repeated { seed, f }))
}

#[derive(Debug, Clone)]
pub struct RepeatedCursor {
    value: Value,
    f: Value,
    position: i64,
}

impl NativeValue for RepeatedCursor {
    fn type_name(&self) -> &'static str {
        "iterator"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Advances a `repeated(v, fn)` cursor by calling `fn(current)`. Lives
/// outside `advance_sync` because it is the one cursor kind whose
/// advance may suspend.
pub fn advance_repeated(caller: StateRef, ctx: &Context, cursor: Value) -> Step {
    let Value::Native(n) = &cursor else {
        return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "not a repeated cursor"));
    };
    let Some(c) = n.downcast_ref::<RepeatedCursor>() else {
        return Step::TailCall(caller, raise(kinds::TYPE_ERROR, "not a repeated cursor"));
    };
    struct Resume {
        caller: StateRef,
        f: Value,
        position: i64,
    }
    impl State for Resume {
        fn run(self: Rc<Self>, _ctx: &Context, value: Value) -> Step {
            if value.is_error() {
                return Step::TailCall(self.caller.clone(), value);
            }
            let next = Value::Native(Rc::new(RepeatedCursor { value, f: self.f.clone(), position: self.position + 1 }));
            Step::TailCall(self.caller.clone(), next)
        }
    }
    let resume = Rc::new(Resume { caller, f: c.f.clone(), position: c.position });
    call_value(resume, ctx, c.f.clone(), vec![c.value.clone()])
}

/// `grouped(seq_1, …, seq_k, fn)`: advances every sub-iterator in lockstep
/// and calls `fn(v_1, …, v_k)` for each position, terminating on the
/// first sub-iterator that exhausts. `fn` is an arbitrary callable that
/// may suspend, so this is a genuine `State` machine; unlike `limited`/
/// `skipped`/`unique`, the result is collected eagerly into a `List`
/// rather than exposed as a lazily-composable cursor — `grouped` has no
/// meaningful restart semantics to preserve once its callback runs
/// side effects, and every call site in this crate's stdlib surface
/// (`map`, combinators.rs's reducers) wants the whole collection anyway.
pub struct Grouped {
    iters: RefCell<Vec<Value>>,
    f: Value,
    results: RefCell<minilang_core::List>,
    caller: RefCell<Option<StateRef>>,
}

impl fmt::Debug for Grouped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<grouped>")
    }
}

impl Grouped {
    pub fn start(ctx: &Context, caller: StateRef, seqs: Vec<Value>, f: Value) -> Step {
        let mut iters = Vec::with_capacity(seqs.len());
        for seq in &seqs {
            let it = iterate_sync(seq);
            if matches!(it, Value::Nil) {
                return Step::TailCall(caller, Value::List(Rc::new(RefCell::new(minilang_core::List::new()))));
            }
            iters.push(it);
        }
        let values: Vec<Value> = iters.iter().map(cursor_val).collect();
        let g = Rc::new(Grouped {
            iters: RefCell::new(iters),
            f: f.clone(),
            results: RefCell::new(minilang_core::List::new()),
            caller: RefCell::new(Some(caller)),
        });
        call_value(g as StateRef, ctx, f, values)
    }

    fn finish(&self) -> Value {
        Value::List(Rc::new(RefCell::new(std::mem::replace(
            &mut self.results.borrow_mut(),
            minilang_core::List::new(),
        ))))
    }
}

impl State for Grouped {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        if value.is_error() {
            return match self.caller.borrow_mut().take() {
                Some(c) => Step::TailCall(c, value),
                None => Step::Parked,
            };
        }
        self.results.borrow_mut().push_back(value);
        let mut advanced = Vec::with_capacity(self.iters.borrow().len());
        for it in self.iters.borrow().iter() {
            let next = advance_sync(it);
            if matches!(next, Value::Nil) {
                let finished = self.finish();
                return match self.caller.borrow_mut().take() {
                    Some(c) => Step::TailCall(c, finished),
                    None => Step::Parked,
                };
            }
            advanced.push(next);
        }
        *self.iters.borrow_mut() = advanced;
        let values: Vec<Value> = self.iters.borrow().iter().map(cursor_val).collect();
        let f = self.f.clone();
        call_value(self as StateRef, ctx, f, values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RootState;
    use std::cell::RefCell as StdRefCell;

    fn drain(ctx: &Context, seq: Value) -> Vec<Value> {
        let mut out = Vec::new();
        let mut cur = match iterate_value(RootState::new(), ctx, seq) {
            Step::TailCall(_, v) => v,
            _ => panic!(),
        };
        while !matches!(cur, Value::Nil) {
            out.push(cursor_val(&cur));
            cur = match next_value(RootState::new(), ctx, cur) {
                Step::TailCall(_, v) => v,
                _ => panic!(),
            };
        }
        out
    }

    #[test]
    fn range_iterates_all_values_inclusive() {
        let ctx = Context::new();
        assert_eq!(drain(&ctx, range(1, 3)), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn empty_range_iterates_to_nil() {
        let ctx = Context::new();
        match iterate_value(RootState::new(), &ctx, range(5, 1)) {
            Step::TailCall(_, Value::Nil) => {}
            _ => panic!("expected empty range to be nil"),
        }
    }

    #[test]
    fn limited_stops_after_n_values() {
        let ctx = Context::new();
        assert_eq!(drain(&ctx, limited(range(1, 100), 3)), vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn skipped_discards_leading_values() {
        let ctx = Context::new();
        assert_eq!(drain(&ctx, skipped(range(1, 5), 2)), vec![Value::Int(3), Value::Int(4), Value::Int(5)]);
    }

    #[test]
    fn sequenced_concatenates_two_sequences() {
        let ctx = Context::new();
        assert_eq!(
            drain(&ctx, sequenced(range(1, 2), range(10, 11))),
            vec![Value::Int(1), Value::Int(2), Value::Int(10), Value::Int(11)]
        );
    }

    /// Chained cursors advance through user-function stages, so each
    /// step has to be trampolined to the root instead of read off the
    /// first tail call.
    fn drain_chained(ctx: &Context, seq: Value) -> Vec<Value> {
        let mut out = Vec::new();
        let root = RootState::new();
        if let Step::TailCall(s, v) = iterate_value(root.clone(), ctx, seq) {
            crate::state::drive(ctx, s, v);
        }
        let mut cur = root.result.borrow_mut().take().unwrap();
        while !matches!(cur, Value::Nil) {
            out.push(cursor_val(&cur));
            let root = RootState::new();
            if let Step::TailCall(s, v) = next_value(root.clone(), ctx, cur) {
                crate::state::drive(ctx, s, v);
            }
            cur = root.result.borrow_mut().take().unwrap();
        }
        out
    }

    #[test]
    fn chained_applies_its_stages_in_order() {
        let ctx = Context::new();
        let double = crate::native_fn::NativeFn::new("double", |caller, _ctx, args| {
            let Value::Int(i) = args[0] else { unreachable!() };
            Step::TailCall(caller, Value::Int(i * 2))
        });
        let inc = crate::native_fn::NativeFn::new("inc", |caller, _ctx, args| {
            let Value::Int(i) = args[0] else { unreachable!() };
            Step::TailCall(caller, Value::Int(i + 1))
        });
        let seq = chained(range(1, 3), vec![double, inc]);
        assert_eq!(
            drain_chained(&ctx, seq),
            vec![Value::Int(3), Value::Int(5), Value::Int(7)]
        );
    }

    #[test]
    fn chained_stage_returning_nil_filters_the_element() {
        let ctx = Context::new();
        let odds_only = crate::native_fn::NativeFn::new("odd?", |caller, _ctx, args| {
            let Value::Int(i) = args[0] else { unreachable!() };
            Step::TailCall(caller, if i % 2 == 1 { Value::Int(i) } else { Value::Nil })
        });
        let seq = chained(range(1, 6), vec![odds_only]);
        assert_eq!(
            drain_chained(&ctx, seq),
            vec![Value::Int(1), Value::Int(3), Value::Int(5)]
        );
    }

    #[test]
    fn unary_sequenced_repeats_itself_forever() {
        let ctx = Context::new();
        assert_eq!(
            drain(&ctx, limited(cycled(range(1, 2)), 5)),
            vec![Value::Int(1), Value::Int(2), Value::Int(1), Value::Int(2), Value::Int(1)]
        );
    }

    #[test]
    fn unary_sequenced_over_an_empty_sequence_stays_empty() {
        let ctx = Context::new();
        match iterate_value(RootState::new(), &ctx, cycled(range(5, 1))) {
            Step::TailCall(_, Value::Nil) => {}
            _ => panic!("expected nil"),
        }
    }

    #[test]
    fn unique_suppresses_repeats() {
        let ctx = Context::new();
        let mut list = minilang_core::List::new();
        for v in [1, 1, 2, 3, 3, 3, 4] {
            list.push_back(Value::Int(v));
        }
        let seq = Value::List(Rc::new(StdRefCell::new(list)));
        assert_eq!(
            drain(&ctx, unique(seq)),
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
        );
    }

    #[test]
    fn repeated_advances_by_calling_its_function() {
        let ctx = Context::new();
        let double = crate::native_fn::NativeFn::new("double", |caller, _ctx, args| {
            let Value::Int(i) = args[0] else { unreachable!() };
            Step::TailCall(caller, Value::Int(i * 2))
        });
        let seq = repeated(Value::Int(1), double);
        let first = match iterate_value(RootState::new(), &ctx, seq) {
            Step::TailCall(_, v) => v,
            _ => panic!(),
        };
        assert_eq!(cursor_val(&first), Value::Int(1));
        let second = match advance_repeated(RootState::new(), &ctx, first) {
            Step::TailCall(_, v) => v,
            _ => panic!(),
        };
        assert_eq!(cursor_val(&second), Value::Int(2));
        let third = match advance_repeated(RootState::new(), &ctx, second) {
            Step::TailCall(_, v) => v,
            _ => panic!(),
        };
        assert_eq!(cursor_val(&third), Value::Int(4));
    }

    #[test]
    fn grouped_zips_two_sequences_with_a_function() {
        let ctx = Context::new();
        let f = crate::native_fn::NativeFn::new("add", |caller, _ctx, args| {
            let (Value::Int(a), Value::Int(b)) = (args[0].clone(), args[1].clone()) else {
                unreachable!()
            };
            Step::TailCall(caller, Value::Int(a + b))
        });
        let result = match Grouped::start(&ctx, RootState::new(), vec![range(1, 3), range(10, 12)], f) {
            Step::TailCall(_, v) => v,
            Step::Parked => panic!("expected synchronous completion"),
        };
        let Value::List(list) = result else { panic!("expected a list") };
        let sums: Vec<Value> = list.borrow().iter_values().collect();
        assert_eq!(sums, vec![Value::Int(11), Value::Int(13), Value::Int(15)]);
    }
}
