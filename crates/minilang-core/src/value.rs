//! The uniform boxed value and the open extension point native types use
//! to plug into it.
//!
//! Every value a minilang program can hold is a [`Value`]. Containers
//! (`List`, `Map`, `Tuple`, `Names`, `StringBuffer`) are first-class
//! variants owned here because this crate defines their invariants.
//! Everything the *interpreter* layer owns — closures, frames/suspensions,
//! classes and instances, tasks, native functions — lives behind
//! [`Value::Native`] so this crate never has to depend on `minilang-vm`.
//!
//! [`NativeValue`] is the open half of the type descriptor described by
//! the data model: `hash`/`deref`/`assign`/`call`/`next`/`key` for native
//! types are implemented as free functions in `minilang-vm` that match on
//! `Value::Native` and downcast via [`NativeValue::as_any`], rather than as
//! virtual methods on the trait itself — the closed enum plus downcasting
//! is the idiomatic Rust shape for "uniform value, few concrete kinds",
//! and keeps the hot dispatch path a `match` instead of a vtable call.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::ErrorValue;
use crate::list::List;
use crate::map::Map;
use crate::stringbuffer::StringBuffer;

/// The open extension point for interpreter-owned reference types.
///
/// A native value must be able to name its own type (for error messages
/// and `Type` comparisons) and hand back `&dyn Any` so call sites in
/// `minilang-vm` can downcast to the concrete type they expect.
pub trait NativeValue: Any + fmt::Debug {
    fn type_name(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
}

impl dyn NativeValue {
    /// Attempts to recover the concrete type behind a native value.
    pub fn downcast_ref<T: NativeValue>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Recovers an `Rc<T>` sharing the same allocation as `value`, the way
/// `Rc<dyn Any>::downcast` does for `std`'s own trait object — needed
/// wherever a native type (a class, a task) must hand out further `Rc`
/// clones of itself rather than just a borrow.
pub fn downcast_native_rc<T: NativeValue>(value: Rc<dyn NativeValue>) -> Option<Rc<T>> {
    if value.as_any().is::<T>() {
        let ptr = Rc::into_raw(value) as *const T;
        Some(unsafe { Rc::from_raw(ptr) })
    } else {
        None
    }
}

/// The uniform boxed value.
#[derive(Clone)]
pub enum Value {
    /// The falsy singleton; also yielded by `iterate`/`next` at exhaustion.
    Nil,
    /// The truthy placeholder singleton.
    Some,
    Int(i64),
    Real(f64),
    Str(Rc<str>),
    /// A method-name / field-name symbol. Distinct from `Str` so that
    /// `Names` (keyword-argument labels) and field identities compare by
    /// interned identity the way the data model expects.
    Symbol(Rc<str>),
    Tuple(Rc<[Value]>),
    /// An ordered list of symbol values carrying keyword-argument labels.
    Names(Rc<[Rc<str>]>),
    List(Rc<RefCell<List>>),
    Map(Rc<RefCell<Map>>),
    StringBuffer(Rc<RefCell<StringBuffer>>),
    /// A single-slot mutable cell: `deref` returns the slot, `assign`
    /// updates it. Used for captured locals and `var` bindings.
    Reference(Rc<RefCell<Value>>),
    /// A compiler forward-reference placeholder. Resolving it (`LETI`)
    /// patches every recorded prior use in place.
    Uninitialized(Rc<RefCell<UninitializedSlot>>),
    Error(Rc<RefCell<ErrorValue>>),
    /// Everything owned by the interpreter layer: closures, frames,
    /// suspensions, classes, instances, tasks, native functions.
    Native(Rc<dyn NativeValue>),
}

/// A forward reference recorded by `ENTER`/`CLOSURE` before the name it
/// names has been assigned. `patches` holds every `Value::Reference`-like
/// slot that recorded a use of this placeholder; `LETI` walks them and
/// overwrites each with the resolved value.
#[derive(Debug, Default)]
pub struct UninitializedSlot {
    pub resolved: Option<Value>,
    pub patches: Vec<Rc<RefCell<Value>>>,
}

impl PartialEq for Value {
    /// Structural equality for the literal-ish variants; everything else
    /// (containers, references, native objects) compares by identity.
    /// This is a convenience for tests and simple `==` use; the language
    /// semantics' actual `compare` method lives with the external method
    /// resolver and is not reimplemented here.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Some, Value::Some) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => a == b,
            (Value::Names(a), Value::Names(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::StringBuffer(a), Value::StringBuffer(b)) => Rc::ptr_eq(a, b),
            (Value::Reference(a), Value::Reference(b)) => Rc::ptr_eq(a, b),
            (Value::Uninitialized(a), Value::Uninitialized(b)) => Rc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => Rc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Some => write!(f, "some"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Symbol(s) => write!(f, ":{s}"),
            Value::Tuple(t) => write!(f, "({:?})", t.iter().collect::<Vec<_>>()),
            Value::Names(n) => write!(f, "names{:?}", n),
            Value::List(_) => write!(f, "<list>"),
            Value::Map(_) => write!(f, "<map>"),
            Value::StringBuffer(_) => write!(f, "<stringbuffer>"),
            Value::Reference(_) => write!(f, "<reference>"),
            Value::Uninitialized(_) => write!(f, "<uninitialized>"),
            Value::Error(e) => write!(f, "<error {}>", e.borrow()),
            Value::Native(n) => write!(f, "<{}>", n.type_name()),
        }
    }
}

/// The canonical user-facing rendering: scalars bare, lists as
/// `[a, b, ...]`, maps as `{k=v, ...}` in insertion order. Stable across
/// repeated calls for an unchanged value.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Some => write!(f, "some"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            Value::Names(labels) => {
                write!(f, "names(")?;
                for (i, label) in labels.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{label}")?;
                }
                write!(f, ")")
            }
            Value::List(list) => match list.try_borrow() {
                Ok(list) => {
                    write!(f, "[")?;
                    for (i, item) in list.iter_values().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{item}")?;
                    }
                    write!(f, "]")
                }
                Err(_) => write!(f, "[...]"),
            },
            Value::Map(map) => match map.try_borrow() {
                Ok(map) => {
                    write!(f, "{{")?;
                    for (i, (k, v)) in map.iter_insertion_order().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{k}={v}")?;
                    }
                    write!(f, "}}")
                }
                Err(_) => write!(f, "{{...}}"),
            },
            Value::StringBuffer(buf) => write!(f, "{}", buf.borrow().to_string_lossy()),
            Value::Reference(cell) => write!(f, "{}", cell.borrow()),
            Value::Uninitialized(_) => write!(f, "<uninitialized>"),
            Value::Error(e) => write!(f, "{}", e.borrow()),
            Value::Native(n) => write!(f, "<{}>", n.type_name()),
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Some => "some",
            Value::Int(_) => "integer",
            Value::Real(_) => "real",
            Value::Str(_) => "string",
            Value::Symbol(_) => "symbol",
            Value::Tuple(_) => "tuple",
            Value::Names(_) => "names",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::StringBuffer(_) => "stringbuffer",
            Value::Reference(_) => "reference",
            Value::Uninitialized(_) => "uninitialized",
            Value::Error(_) => "error",
            Value::Native(n) => n.type_name(),
        }
    }

    /// Nil is the only falsy value; every other value, including `0` and
    /// the empty string, is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil)
    }

    /// True for a *propagating* error: one a `catch` has demoted to data
    /// (`caught`) no longer short-circuits the handlers that see it.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(e) if !e.borrow().caught)
    }

    pub fn symbol(name: impl Into<Rc<str>>) -> Value {
        Value::Symbol(name.into())
    }

    pub fn string(s: impl Into<Rc<str>>) -> Value {
        Value::Str(s.into())
    }

    pub fn reference(initial: Value) -> Value {
        Value::Reference(Rc::new(RefCell::new(initial)))
    }

    /// Builds a fixed-arity immutable tuple from already-evaluated values
    /// (the `TUPLE_NEW`/`TUPLE_SET` opcodes build one incrementally; this
    /// is the all-at-once convenience used by builtins and tests).
    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(items.into())
    }

    /// Builds a `Names` value carrying keyword-argument labels.
    pub fn names(labels: Vec<Rc<str>>) -> Value {
        Value::Names(labels.into())
    }

    /// Collapses references to their underlying value; every other value,
    /// including native objects, derefs to itself. Native types that want
    /// non-identity deref semantics (e.g. a task awaiting a value) do so
    /// in `minilang-vm`'s dispatch, not here.
    pub fn deref(&self) -> Value {
        match self {
            Value::Reference(cell) => cell.borrow().clone(),
            other => other.clone(),
        }
    }

    /// Writes through a reference cell; assigning to anything else is a
    /// `TypeError`.
    pub fn assign(&self, new: Value) -> Value {
        match self {
            Value::Reference(cell) => {
                *cell.borrow_mut() = new.clone();
                new
            }
            other => crate::error::raise(
                crate::error::kinds::TYPE_ERROR,
                format!("cannot assign to {}", other.type_name()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_is_the_only_falsy_value() {
        assert!(!Value::Nil.is_truthy());
        assert!(Value::Int(0).is_truthy());
        assert!(Value::string("").is_truthy());
        assert!(Value::Some.is_truthy());
    }

    #[test]
    fn deref_is_idempotent() {
        let r = Value::reference(Value::Int(5));
        let once = r.deref();
        let twice = once.deref();
        match (once, twice) {
            (Value::Int(a), Value::Int(b)) => assert_eq!(a, b),
            _ => panic!("expected integers"),
        }
    }

    #[test]
    fn assign_writes_through_a_reference() {
        let r = Value::reference(Value::Nil);
        r.assign(Value::Int(42));
        match r.deref() {
            Value::Int(42) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn assign_on_non_reference_is_a_type_error() {
        let v = Value::Int(1);
        let result = v.assign(Value::Int(2));
        assert!(result.is_error());
    }

    #[test]
    fn list_rendering_is_canonical_and_stable() {
        let mut list = crate::List::new();
        for i in 1..=3 {
            list.push_back(Value::Int(i));
        }
        let v = Value::List(Rc::new(RefCell::new(list)));
        let first = v.to_string();
        assert_eq!(first, "[1, 2, 3]");
        assert_eq!(v.to_string(), first);
    }

    #[test]
    fn map_rendering_follows_insertion_order() {
        let mut map = crate::Map::new();
        map.insert(Value::symbol("a"), Value::Int(1));
        map.insert(Value::symbol("b"), Value::Int(2));
        let v = Value::Map(Rc::new(RefCell::new(map)));
        assert_eq!(v.to_string(), "{a=1, b=2}");
    }
}
