//! Sequence reducers: `all`, `map`, `count`, `min`, `max`, `sum`,
//! `prod`, `fold`. Each drives the four-call iteration protocol directly
//! rather than going through a `Cursor`, since a reducer's own identity
//! (the frame that called `all(seq)`) is the continuation a suspending
//! sub-iterator or comparator resumes into.

use std::cell::RefCell;
use std::rc::Rc;

use minilang_core::map::Map;
use minilang_core::Value;

use crate::dispatch::{call_value, deref_value};
use crate::iterate::{iterate_value, key_value, next_value, value_value};
use crate::state::{Context, State, StateRef, Step};

/// The shape of a per-type sequence-operation override attached through
/// the context's type registry: a concrete type short-circuits a
/// generic reducer without going through method dispatch.
pub struct TypedSeqFn(pub Box<dyn Fn(&Context, StateRef, Value) -> Step>);

/// What a reducer does with each `(key, value)` pair it visits, and how
/// it turns accumulated state into a final result. `fold`/`min`/`max`
/// share the "replace only on non-nil `fn(acc, v)`" rule; `sum`/
/// `prod` are `fold` seeded with `+`/`*`; `all`/`map`/`count` don't call
/// a user function per step at all, so they're driven directly instead of
/// through this trait.
enum Mode {
    All(RefCell<minilang_core::List>),
    MapPairs(RefCell<Map>),
    Count(RefCell<i64>),
    Fold { acc: RefCell<Option<Value>>, f: Value },
}

/// Drives `iterate`/`next`/`key`/`value` over `seq`, applying `mode` at
/// each step. This is the one state machine backing every reducer; the
/// public `all`/`map`/`count`/`fold`/`min`/`max`/`sum`/`prod` entry
/// points just pick a `Mode` and an initial accumulator.
struct Reduce {
    caller: RefCell<Option<StateRef>>,
    mode: Mode,
    /// Which leg of the iteration call we're waiting on.
    phase: RefCell<Phase>,
    cursor: RefCell<Value>,
    /// Holds a key fetched by `MapPairs` while its matching value is
    /// still being awaited.
    pending_key: RefCell<Option<Value>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Phase {
    Iterating,
    AwaitingKey,
    AwaitingValue,
    AwaitingFold,
    AwaitingNext,
}

impl Reduce {
    fn start(ctx: &Context, caller: StateRef, seq: Value, mode: Mode) -> Step {
        let r = Rc::new(Reduce {
            caller: RefCell::new(Some(caller)),
            mode,
            phase: RefCell::new(Phase::Iterating),
            cursor: RefCell::new(Value::Nil),
            pending_key: RefCell::new(None),
        });
        iterate_value(r, ctx, seq)
    }

    fn finish(&self) -> Value {
        match &self.mode {
            Mode::All(list) => Value::List(Rc::new(RefCell::new(std::mem::replace(&mut list.borrow_mut(), minilang_core::List::new())))),
            Mode::MapPairs(map) => Value::Map(Rc::new(RefCell::new(std::mem::replace(&mut map.borrow_mut(), Map::new())))),
            Mode::Count(n) => Value::Int(*n.borrow()),
            Mode::Fold { acc, .. } => acc.borrow().clone().unwrap_or(Value::Nil),
        }
    }

    fn finish_step(self: Rc<Self>) -> Step {
        let result = self.finish();
        match self.caller.borrow_mut().take() {
            Some(c) => Step::TailCall(c, result),
            None => Step::Parked,
        }
    }
}

impl State for Reduce {
    fn run(self: Rc<Self>, ctx: &Context, value: Value) -> Step {
        if value.is_error() {
            return match self.caller.borrow_mut().take() {
                Some(c) => Step::TailCall(c, value),
                None => Step::Parked,
            };
        }
        let phase = *self.phase.borrow();
        match phase {
            Phase::Iterating | Phase::AwaitingNext => {
                if matches!(value, Value::Nil) {
                    return self.finish_step();
                }
                *self.cursor.borrow_mut() = value.clone();
                match &self.mode {
                    Mode::Count(n) => {
                        *n.borrow_mut() += 1;
                        *self.phase.borrow_mut() = Phase::AwaitingNext;
                        next_value(self, ctx, value)
                    }
                    Mode::All(_) => {
                        *self.phase.borrow_mut() = Phase::AwaitingValue;
                        value_value(self, ctx, value)
                    }
                    Mode::MapPairs(_) => {
                        *self.phase.borrow_mut() = Phase::AwaitingKey;
                        key_value(self, ctx, value)
                    }
                    Mode::Fold { .. } => {
                        *self.phase.borrow_mut() = Phase::AwaitingValue;
                        value_value(self, ctx, value)
                    }
                }
            }
            Phase::AwaitingKey => {
                // `value` is the key; stash it by re-borrowing the cursor
                // and fetching the value next.
                *self.phase.borrow_mut() = Phase::AwaitingValue;
                let cursor = self.cursor.borrow().clone();
                self.pending_key.replace(Some(value));
                value_value(self, ctx, cursor)
            }
            Phase::AwaitingValue => match &self.mode {
                Mode::All(list) => {
                    list.borrow_mut().push_back(deref_value(&value));
                    let cursor = self.cursor.borrow().clone();
                    *self.phase.borrow_mut() = Phase::AwaitingNext;
                    next_value(self, ctx, cursor)
                }
                Mode::MapPairs(map) => {
                    let key = self.pending_key.borrow_mut().take().unwrap_or(Value::Nil);
                    map.borrow_mut().insert(key, deref_value(&value));
                    let cursor = self.cursor.borrow().clone();
                    *self.phase.borrow_mut() = Phase::AwaitingNext;
                    next_value(self, ctx, cursor)
                }
                Mode::Fold { acc, f } => {
                    let current = acc.borrow().clone();
                    match current {
                        None => {
                            *acc.borrow_mut() = Some(deref_value(&value));
                            let cursor = self.cursor.borrow().clone();
                            *self.phase.borrow_mut() = Phase::AwaitingNext;
                            next_value(self, ctx, cursor)
                        }
                        Some(prev) => {
                            let f = f.clone();
                            *self.phase.borrow_mut() = Phase::AwaitingFold;
                            call_value(self, ctx, f, vec![prev, deref_value(&value)])
                        }
                    }
                }
                Mode::Count(_) => unreachable!(),
            },
            Phase::AwaitingFold => {
                let Mode::Fold { acc, .. } = &self.mode else { unreachable!() };
                if value.is_truthy() {
                    *acc.borrow_mut() = Some(value);
                }
                let cursor = self.cursor.borrow().clone();
                *self.phase.borrow_mut() = Phase::AwaitingNext;
                next_value(self, ctx, cursor)
            }
        }
    }
}

pub fn all(ctx: &Context, caller: StateRef, seq: Value) -> Step {
    Reduce::start(ctx, caller, seq, Mode::All(RefCell::new(minilang_core::List::new())))
}

pub fn map_pairs(ctx: &Context, caller: StateRef, seq: Value) -> Step {
    Reduce::start(ctx, caller, seq, Mode::MapPairs(RefCell::new(Map::new())))
}

pub fn count(ctx: &Context, caller: StateRef, seq: Value) -> Step {
    Reduce::start(ctx, caller, seq, Mode::Count(RefCell::new(0)))
}

pub fn fold(ctx: &Context, caller: StateRef, seq: Value, f: Value) -> Step {
    Reduce::start(ctx, caller, seq, Mode::Fold { acc: RefCell::new(None), f })
}

fn comparator(name: &'static str, pick_left: bool) -> Value {
    crate::native_fn::NativeFn::new(name, move |caller, _ctx, args| {
        let keep = minilang_core::map::compare_value(&args[0], &args[1]);
        let take_left = matches!(keep, std::cmp::Ordering::Less | std::cmp::Ordering::Equal) == pick_left;
        Step::TailCall(caller, if take_left { args[0].clone() } else { args[1].clone() })
    })
}

/// `min`/`max` are `fold` seeded by the first element, reducing with `<`
/// / `>` respectively; an empty sequence therefore folds to `Nil` by
/// construction (no first element ever arrives to seed the accumulator).
pub fn min(ctx: &Context, caller: StateRef, seq: Value) -> Step {
    fold(ctx, caller, seq, comparator("<", true))
}

pub fn max(ctx: &Context, caller: StateRef, seq: Value) -> Step {
    fold(ctx, caller, seq, comparator(">", false))
}

fn arith(name: &'static str, op: fn(i64, i64) -> i64, opf: fn(f64, f64) -> f64) -> Value {
    crate::native_fn::NativeFn::new(name, move |caller, _ctx, args| {
        let result = match (&args[0], &args[1]) {
            (Value::Int(a), Value::Int(b)) => Value::Int(op(*a, *b)),
            (Value::Real(a), Value::Real(b)) => Value::Real(opf(*a, *b)),
            (Value::Int(a), Value::Real(b)) => Value::Real(opf(*a as f64, *b)),
            (Value::Real(a), Value::Int(b)) => Value::Real(opf(*a, *b as f64)),
            _ => minilang_core::error::raise(minilang_core::error::kinds::TYPE_ERROR, "expected numbers"),
        };
        Step::TailCall(caller, result)
    })
}

pub fn sum(ctx: &Context, caller: StateRef, seq: Value) -> Step {
    fold(ctx, caller, seq, arith("+", |a, b| a + b, |a, b| a + b))
}

pub fn prod(ctx: &Context, caller: StateRef, seq: Value) -> Step {
    fold(ctx, caller, seq, arith("*", |a, b| a * b, |a, b| a * b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterate::range;
    use crate::state::RootState;

    fn drive(ctx: &Context, step: Step) {
        if let Step::TailCall(s, v) = step {
            crate::state::drive(ctx, s, v);
        }
    }

    #[test]
    fn all_collects_a_range_into_a_list() {
        let ctx = Context::new();
        let root = RootState::new();
        drive(&ctx, all(&ctx, root.clone(), range(1, 5)));
        let Value::List(list) = root.result.borrow().clone().unwrap() else { panic!() };
        let items: Vec<Value> = list.borrow().iter_values().collect();
        assert_eq!(items, vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4), Value::Int(5)]);
    }

    #[test]
    fn sum_adds_a_range() {
        let ctx = Context::new();
        let root = RootState::new();
        drive(&ctx, sum(&ctx, root.clone(), range(1, 100)));
        assert!(matches!(root.result.borrow().as_ref(), Some(Value::Int(5050))));
    }

    #[test]
    fn fold_multiplies_a_range_into_a_factorial() {
        let ctx = Context::new();
        let root = RootState::new();
        drive(&ctx, prod(&ctx, root.clone(), range(1, 4)));
        assert!(matches!(root.result.borrow().as_ref(), Some(Value::Int(24))));
    }

    #[test]
    fn count_counts_unique_values() {
        let ctx = Context::new();
        let root = RootState::new();
        let seq = crate::iterate::unique(range(1, 4));
        drive(&ctx, count(&ctx, root.clone(), seq));
        assert!(matches!(root.result.borrow().as_ref(), Some(Value::Int(4))));
    }

    #[test]
    fn map_pairs_keys_a_range_by_position() {
        let ctx = Context::new();
        let root = RootState::new();
        drive(&ctx, map_pairs(&ctx, root.clone(), range(1, 3)));
        let Value::Map(map) = root.result.borrow().clone().unwrap() else { panic!() };
        let entries: Vec<(Value, Value)> = map.borrow().iter_insertion_order().collect();
        assert_eq!(
            entries,
            vec![(Value::Int(1), Value::Int(1)), (Value::Int(2), Value::Int(2)), (Value::Int(3), Value::Int(3))]
        );
    }
}
