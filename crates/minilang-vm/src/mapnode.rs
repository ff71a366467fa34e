//! Map node addressing: the assignable handle `map[key]` produces.
//!
//! Looking a key up in a map does not answer "what value is there" but
//! hands back a *node*, a reference-like value bound to `(map, key)`.
//! Dereferencing a node for a missing key yields `Nil` (a "floating"
//! node); assigning through it inserts the key with the assigned value.
//! This is what lets `map[key] := v` and `with slot := map[key]` work
//! with the same deref/assign discipline as a plain reference cell.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use minilang_core::map::Map;
use minilang_core::value::NativeValue;
use minilang_core::Value;

use crate::dispatch::call_value;
use crate::state::{Context, State, StateRef, Step};

/// A `(map, key)` handle: floating while the key is absent, backed once
/// it (or an assignment through this node) inserts it.
pub struct MapNode {
    pub map: Rc<RefCell<Map>>,
    pub key: Value,
}

impl fmt::Debug for MapNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<map-node {:?}>", self.key)
    }
}

impl NativeValue for MapNode {
    fn type_name(&self) -> &'static str {
        "map-node"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl MapNode {
    pub fn new(map: Rc<RefCell<Map>>, key: Value) -> Value {
        Value::Native(Rc::new(MapNode { map, key }))
    }

    /// `deref`: the stored value, or `Nil` while the node floats.
    pub fn deref(&self) -> Value {
        self.map.borrow().search(&self.key).unwrap_or(Value::Nil)
    }

    /// `assign`: writes through the node, inserting the key if it was
    /// still floating.
    pub fn assign(&self, value: Value) -> Value {
        self.map.borrow_mut().insert(self.key.clone(), value.clone());
        value
    }
}

/// `map[key, fn]`: returns the node for `key`, calling `fn(key)` to
/// materialize and insert a default first if the key is absent. `fn`
/// may suspend, so the
/// insert-on-completion leg is a `State`.
pub fn node_or_default(caller: StateRef, ctx: &Context, map: Rc<RefCell<Map>>, key: Value, default: Value) -> Step {
    if map.borrow().contains_key(&key) {
        return Step::TailCall(caller, MapNode::new(map, key));
    }
    struct InsertDefault {
        caller: StateRef,
        map: Rc<RefCell<Map>>,
        key: Value,
    }
    impl State for InsertDefault {
        fn run(self: Rc<Self>, _ctx: &Context, value: Value) -> Step {
            if value.is_error() {
                return Step::TailCall(self.caller.clone(), value);
            }
            self.map.borrow_mut().insert(self.key.clone(), value);
            Step::TailCall(self.caller.clone(), MapNode::new(self.map.clone(), self.key.clone()))
        }
    }
    let insert = Rc::new(InsertDefault { caller, map, key: key.clone() });
    call_value(insert, ctx, default, vec![key])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RootState;

    #[test]
    fn floating_node_derefs_to_nil_until_assigned() {
        let map = Rc::new(RefCell::new(Map::new()));
        let node = MapNode::new(map.clone(), Value::symbol("k"));
        let Value::Native(n) = &node else { panic!() };
        let node = n.downcast_ref::<MapNode>().unwrap();
        assert!(matches!(node.deref(), Value::Nil));
        node.assign(Value::Int(5));
        assert!(matches!(node.deref(), Value::Int(5)));
        assert_eq!(map.borrow().search(&Value::symbol("k")), Some(Value::Int(5)));
    }

    #[test]
    fn node_for_existing_key_reads_the_stored_value() {
        let map = Rc::new(RefCell::new(Map::new()));
        map.borrow_mut().insert(Value::symbol("k"), Value::Int(3));
        let node = MapNode::new(map, Value::symbol("k"));
        let Value::Native(n) = &node else { panic!() };
        assert!(matches!(n.downcast_ref::<MapNode>().unwrap().deref(), Value::Int(3)));
    }

    #[test]
    fn default_fn_materializes_and_inserts_a_missing_key() {
        let ctx = Context::new();
        let map = Rc::new(RefCell::new(Map::new()));
        let default = crate::native_fn::NativeFn::new("default", |caller, _ctx, _args| {
            Step::TailCall(caller, Value::Int(99))
        });
        let root = RootState::new();
        let step = node_or_default(root.clone(), &ctx, map.clone(), Value::symbol("k"), default);
        if let Step::TailCall(s, v) = step {
            crate::state::drive(&ctx, s, v);
        }
        let node = root.result.borrow_mut().take().unwrap();
        let Value::Native(n) = &node else { panic!() };
        assert!(matches!(n.downcast_ref::<MapNode>().unwrap().deref(), Value::Int(99)));
        assert_eq!(map.borrow().search(&Value::symbol("k")), Some(Value::Int(99)));
    }

    #[test]
    fn default_fn_error_propagates_without_inserting() {
        let ctx = Context::new();
        let map = Rc::new(RefCell::new(Map::new()));
        let boom = crate::native_fn::NativeFn::new("boom", |caller, _ctx, _args| {
            Step::TailCall(caller, minilang_core::error::raise(minilang_core::error::kinds::VALUE_ERROR, "boom"))
        });
        let root = RootState::new();
        let step = node_or_default(root.clone(), &ctx, map.clone(), Value::symbol("k"), boom);
        if let Step::TailCall(s, v) = step {
            crate::state::drive(&ctx, s, v);
        }
        assert!(root.result.borrow_mut().take().unwrap().is_error());
        assert!(map.borrow().is_empty());
    }
}
