//! Minilang core: the value model, container primitives, and the ordered
//! hashed-AVL map that the bytecode interpreter in `minilang-vm` is built
//! on top of.
//!
//! # Modules
//!
//! - `error`: the language-level error value and this crate's own
//!   construction-time error type.
//! - `value`: the uniform boxed `Value` and the `NativeValue` extension
//!   point interpreter-owned types plug into.
//! - `list`: doubly-linked ordered sequence with cached indexed access.
//! - `map`: ordered hashed-AVL associative container.
//! - `stringbuffer`: append-only byte builder.
//! - `registry`: type-keyed attachment of typed-function overrides.

pub mod error;
pub mod list;
pub mod map;
pub mod registry;
pub mod stringbuffer;
pub mod value;

pub use error::{ErrorValue, MlError, TraceEntry};
pub use list::List;
pub use map::Map;
pub use registry::TypeRegistry;
pub use stringbuffer::StringBuffer;
pub use value::{NativeValue, UninitializedSlot, Value};

/// One-time process startup documented by the design notes: types are
/// meaningful before methods, which must exist before globals reference
/// them. This crate has no global method table of its own (that lives
/// with the external resolver), so `init` only seeds the singletons that
/// really are process-wide — there is nothing to sequence yet, but the
/// entry point is kept so an embedder has one documented place to call
/// before running any bytecode, keeping the three-pass order stable.
pub fn init() {
    tracing::debug!("minilang-core initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_panic() {
        init();
    }

    #[test]
    fn nil_and_some_are_distinct_singletons_by_behavior() {
        assert!(!Value::Nil.is_truthy());
        assert!(Value::Some.is_truthy());
    }
}
