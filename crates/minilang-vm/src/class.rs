//! Classes and instances: simple single-inheritance records with
//! positional or keyword-bound fields.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use minilang_core::error::{kinds, raise};
use minilang_core::value::NativeValue;
use minilang_core::Value;

/// `class(name, [parent,] field_1, …, field_n)`. Field symbols are
/// ordered inherited-first, then the class's own.
pub struct ClassDef {
    pub name: Rc<str>,
    pub parent: Option<Rc<ClassDef>>,
    /// Declaration order across the whole inheritance chain: inherited
    /// fields first, own fields after.
    pub fields: Vec<Rc<str>>,
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class {}>", self.name)
    }
}

impl NativeValue for ClassDef {
    fn type_name(&self) -> &'static str {
        "class"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl ClassDef {
    pub fn new(name: impl Into<Rc<str>>, parent: Option<Rc<ClassDef>>, own_fields: Vec<Rc<str>>) -> Rc<ClassDef> {
        let mut fields = match &parent {
            Some(p) => p.fields.clone(),
            None => Vec::new(),
        };
        fields.extend(own_fields);
        Rc::new(ClassDef { name: name.into(), parent, fields })
    }

    /// Does `self` equal or descend from `ancestor`, walking the
    /// single-inheritance parent chain.
    pub fn is_a(&self, ancestor: &Rc<ClassDef>) -> bool {
        if std::ptr::eq(self, Rc::as_ptr(ancestor)) {
            return true;
        }
        let mut cur = self.parent.clone();
        while let Some(p) = cur {
            if Rc::ptr_eq(&p, ancestor) {
                return true;
            }
            cur = p.parent.clone();
        }
        false
    }

    /// Builds an instance, binding positional arguments 1-to-1 by
    /// declaration order until a `Names` marker switches to keyword mode
    /// (the in-band keyword convention); extra positional arguments beyond
    /// arity are dropped; unresolvable field names raise `ValueError`;
    /// unset fields default to `Nil`.
    pub fn instantiate(self: Rc<Self>, args: Vec<Value>) -> Value {
        let mut slots = vec![Value::Nil; self.fields.len()];
        let mut args = args.into_iter();
        let mut index = 0;
        while let Some(arg) = args.next() {
            if let Value::Names(labels) = &arg {
                let labels = labels.clone();
                for label in labels.iter() {
                    let Some(value) = args.next() else { break };
                    match self.fields.iter().position(|f| f == label) {
                        Some(slot) => slots[slot] = value,
                        None => {
                            return raise(
                                kinds::VALUE_ERROR,
                                format!("class {} does not have field {}", self.name, label),
                            );
                        }
                    }
                }
                break;
            }
            if index >= self.fields.len() {
                break;
            }
            slots[index] = arg;
            index += 1;
        }
        Value::Native(Rc::new(Instance { class: self.clone(), fields: RefCell::new(slots) }))
    }
}

/// An instance: class pointer plus a field slot vector, each slot usable
/// through the same `deref`/`assign` discipline as a reference cell.
pub struct Instance {
    pub class: Rc<ClassDef>,
    fields: RefCell<Vec<Value>>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} instance>", self.class.name)
    }
}

impl NativeValue for Instance {
    fn type_name(&self) -> &'static str {
        "object"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Instance {
    pub fn field(&self, name: &str) -> Option<Value> {
        let index = self.class.fields.iter().position(|f| f.as_ref() == name)?;
        Some(self.fields.borrow()[index].clone())
    }

    pub fn set_field(&self, name: &str, value: Value) -> Value {
        match self.class.fields.iter().position(|f| f.as_ref() == name) {
            Some(index) => {
                self.fields.borrow_mut()[index] = value.clone();
                value
            }
            None => raise(kinds::VALUE_ERROR, format!("{} does not have field {}", self.class.name, name)),
        }
    }

    /// The assignable handle for one field slot, the object-field analog
    /// of a reference cell. `ValueError` if the class has no such field.
    pub fn field_ref(self: Rc<Self>, name: &str) -> Value {
        match self.class.fields.iter().position(|f| f.as_ref() == name) {
            Some(index) => Value::Native(Rc::new(FieldRef { instance: self, index })),
            None => raise(kinds::VALUE_ERROR, format!("{} does not have field {}", self.class.name, name)),
        }
    }
}

/// A reference into one field slot of an instance: `deref` reads it,
/// `assign` writes it, exactly like a reference cell.
pub struct FieldRef {
    instance: Rc<Instance>,
    index: usize,
}

impl fmt::Debug for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<field {}>", self.instance.class.fields[self.index])
    }
}

impl NativeValue for FieldRef {
    fn type_name(&self) -> &'static str {
        "field"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl FieldRef {
    pub fn deref(&self) -> Value {
        self.instance.fields.borrow()[self.index].clone()
    }

    pub fn assign(&self, value: Value) -> Value {
        self.instance.fields.borrow_mut()[self.index] = value.clone();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positional_fields_bind_in_declaration_order() {
        let point = ClassDef::new("point", None, vec!["x".into(), "y".into()]);
        let instance = point.instantiate(vec![Value::Int(1), Value::Int(2)]);
        let Value::Native(n) = instance else { panic!() };
        let obj = n.downcast_ref::<Instance>().unwrap();
        assert_eq!(obj.field("x"), Some(Value::Int(1)));
        assert_eq!(obj.field("y"), Some(Value::Int(2)));
    }

    #[test]
    fn keyword_fields_bind_by_symbol() {
        let point = ClassDef::new("point", None, vec!["x".into(), "y".into()]);
        let names = Value::names(vec!["y".into()]);
        let instance = point.instantiate(vec![Value::Int(1), names, Value::Int(9)]);
        let Value::Native(n) = instance else { panic!() };
        let obj = n.downcast_ref::<Instance>().unwrap();
        assert_eq!(obj.field("x"), Some(Value::Int(1)));
        assert_eq!(obj.field("y"), Some(Value::Int(9)));
    }

    #[test]
    fn unknown_field_name_is_a_value_error() {
        let point = ClassDef::new("point", None, vec!["x".into()]);
        let names = Value::names(vec!["z".into()]);
        let instance = point.instantiate(vec![names, Value::Int(1)]);
        assert!(instance.is_error());
    }

    #[test]
    fn subclass_inherits_parent_fields_before_its_own() {
        let base = ClassDef::new("base", None, vec!["x".into()]);
        let derived = ClassDef::new("derived", Some(base.clone()), vec!["y".into()]);
        assert_eq!(derived.fields, vec![Rc::from("x"), Rc::from("y")]);
        assert!(derived.is_a(&base));
    }

    #[test]
    fn field_ref_reads_and_writes_the_slot() {
        let point = ClassDef::new("point", None, vec!["x".into()]);
        let instance = point.instantiate(vec![Value::Int(1)]);
        let Value::Native(n) = &instance else { panic!() };
        let obj = minilang_core::value::downcast_native_rc::<Instance>(n.clone()).unwrap();
        let handle = obj.clone().field_ref("x");
        let Value::Native(h) = &handle else { panic!() };
        let field = h.downcast_ref::<FieldRef>().unwrap();
        assert_eq!(field.deref(), Value::Int(1));
        field.assign(Value::Int(7));
        assert_eq!(obj.field("x"), Some(Value::Int(7)));
    }

    #[test]
    fn field_ref_for_an_unknown_field_is_a_value_error() {
        let point = ClassDef::new("point", None, vec!["x".into()]);
        let instance = point.instantiate(vec![]);
        let Value::Native(n) = &instance else { panic!() };
        let obj = minilang_core::value::downcast_native_rc::<Instance>(n.clone()).unwrap();
        assert!(obj.field_ref("zz").is_error());
    }
}
