//! Type-keyed attachment of typed-function overrides.
//!
//! The type descriptor model lets builtin combinators install a
//! per-type implementation of an operation slot (e.g. a faster `iterate`
//! for `List` than the generic protocol would produce) without routing
//! through the external method resolver. This is that side table: a flat
//! map from `(type name, slot name)` to an arbitrary attached value,
//! downcast by the caller.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Default)]
pub struct TypeRegistry {
    slots: HashMap<(&'static str, &'static str), Rc<dyn Any>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry::default()
    }

    pub fn attach<T: Any + 'static>(&mut self, type_name: &'static str, slot: &'static str, value: Rc<T>) {
        self.slots.insert((type_name, slot), value);
    }

    pub fn lookup<T: Any + 'static>(&self, type_name: &'static str, slot: &'static str) -> Option<Rc<T>> {
        self.slots
            .get(&(type_name, slot))
            .and_then(|v| v.clone().downcast::<T>().ok())
    }

    pub fn has(&self, type_name: &'static str, slot: &'static str) -> bool {
        self.slots.contains_key(&(type_name, slot))
    }
}
