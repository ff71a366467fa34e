//! Error kinds and the language-level error value.
//!
//! Two distinct error concepts exist side by side, a Rust-level
//! construction error and an engine-level propagating value:
//!
//! - [`MlError`] is a Rust `thiserror` enum raised by this crate's own
//!   fallible constructors (e.g. a malformed `tasks` configuration at
//!   embedding time, before any bytecode has run).
//! - [`ErrorValue`] is the language-level error described by the data
//!   model: `(kind, message, trace)`. It is what flows through `Value`
//!   during interpretation and is never a Rust `Err` — it propagates as
//!   ordinary data until a `catch` opcode consumes it.

use std::fmt;

use crate::value::Value;

/// A single entry in an error's traceback: the source name and line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub source: String,
    pub line: u32,
}

/// The language-level error value: `(kind, message, trace)`.
///
/// Traces are recorded innermost-first as propagation unwinds.
/// `caught` is the demotion the `catch` opcode performs: a caught error
/// stops short-circuiting handlers and becomes inspectable data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub kind: String,
    pub message: String,
    pub trace: Vec<TraceEntry>,
    pub caught: bool,
}

impl ErrorValue {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorValue {
            kind: kind.into(),
            message: message.into(),
            trace: Vec::new(),
            caught: false,
        }
    }

    /// Appends a traceback entry as the error unwinds through a frame.
    pub fn add_trace(&mut self, source: impl Into<String>, line: u32) {
        self.trace.push(TraceEntry {
            source: source.into(),
            line,
        });
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Recognized error kinds for this core. Kinds are plain strings at
/// the value level; these constants keep call sites from retyping them.
pub mod kinds {
    pub const TYPE_ERROR: &str = "TypeError";
    pub const VALUE_ERROR: &str = "ValueError";
    pub const RANGE_ERROR: &str = "RangeError";
    pub const TASK_ERROR: &str = "TaskError";
    pub const INTERNAL_ERROR: &str = "InternalError";
    /// Reserved for out-of-scope I/O collaborators; defined here so an
    /// embedder can raise them with the same shape, though this crate
    /// never raises them itself.
    pub const FILE_ERROR: &str = "FileError";
    pub const READ_ERROR: &str = "ReadError";
    pub const WRITE_ERROR: &str = "WriteError";
}

/// Construct a `Value::Error` for the common case of no existing trace.
pub fn raise(kind: impl Into<String>, message: impl Into<String>) -> Value {
    Value::Error(std::rc::Rc::new(std::cell::RefCell::new(ErrorValue::new(
        kind, message,
    ))))
}

/// Rust-level error raised by construction-time validation, before the
/// faulty primitive ever runs (an invalid `tasks`/`parallel` bound, a
/// `buffered` ring size out of range). A builtin that hits one converts
/// it with `.into()` at the boundary, so what reaches the interpreter is
/// an ordinary propagating error value.
#[derive(Debug, thiserror::Error)]
pub enum MlError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{kind}: {message}")]
    Engine { kind: String, message: String },
}

impl From<MlError> for Value {
    fn from(err: MlError) -> Value {
        match err {
            MlError::InvalidConfig(msg) => raise(kinds::RANGE_ERROR, msg),
            MlError::Engine { kind, message } => raise(kind, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_is_appended_innermost_first() {
        let mut err = ErrorValue::new(kinds::TYPE_ERROR, "bad value");
        err.add_trace("inner.ml", 10);
        err.add_trace("outer.ml", 3);
        assert_eq!(err.trace[0].source, "inner.ml");
        assert_eq!(err.trace[1].source, "outer.ml");
    }

    #[test]
    fn raise_builds_an_error_value() {
        let v = raise(kinds::VALUE_ERROR, "unknown field");
        match v {
            Value::Error(e) => assert_eq!(e.borrow().kind, kinds::VALUE_ERROR),
            _ => panic!("expected error value"),
        }
    }

    #[test]
    fn invalid_config_converts_to_a_range_error_value() {
        let v: Value = MlError::InvalidConfig("bound must be a non-negative integer".into()).into();
        let Value::Error(e) = v else { panic!("expected error value") };
        assert_eq!(e.borrow().kind, kinds::RANGE_ERROR);
        assert_eq!(e.borrow().message, "bound must be a non-negative integer");
    }

    #[test]
    fn engine_errors_keep_their_kind_through_conversion() {
        let v: Value = MlError::Engine {
            kind: kinds::TYPE_ERROR.into(),
            message: "size must be an integer".into(),
        }
        .into();
        let Value::Error(e) = v else { panic!("expected error value") };
        assert_eq!(e.borrow().kind, kinds::TYPE_ERROR);
    }
}
