//! Tree-walking evaluator for checked scripts.
//!
//! The evaluator owns step counting, recursion depth and the runtime
//! allocation ceiling. Script exceptions ([`Fault::Raise`]) are catchable by
//! `try`; guard and capability faults ([`Fault::Abort`]) unwind straight to
//! the worker.

mod builtins;
mod eval;
mod ops;
mod scope;
pub mod value;

use cordon_script::Span;

use crate::error::SandboxError;

pub use builtins::Builtin;
pub use eval::{ExecContext, Interpreter};
pub use scope::Scope;
pub use value::{Key, Value};

/// Built-in exception names and their parents.
const EXCEPTION_TREE: &[(&str, Option<&str>)] = &[
    ("Exception", None),
    ("ArithmeticError", Some("Exception")),
    ("ZeroDivisionError", Some("ArithmeticError")),
    ("OverflowError", Some("ArithmeticError")),
    ("LookupError", Some("Exception")),
    ("KeyError", Some("LookupError")),
    ("IndexError", Some("LookupError")),
    ("ValueError", Some("Exception")),
    ("TypeError", Some("Exception")),
    ("NameError", Some("Exception")),
    ("AttributeError", Some("Exception")),
    ("AssertionError", Some("Exception")),
    ("CapabilityError", Some("Exception")),
];

/// Whether `name` is one of the built-in exception types.
pub fn is_exception_name(name: &str) -> bool {
    EXCEPTION_TREE.iter().any(|(n, _)| *n == name)
}

/// Whether an exception of type `raised` is caught by a handler for `handler`.
pub fn exception_matches(raised: &str, handler: &str) -> bool {
    let mut current = Some(raised);
    while let Some(name) = current {
        if name == handler {
            return true;
        }
        current = EXCEPTION_TREE
            .iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, parent)| *parent);
    }
    false
}

/// A script-level exception.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptException {
    pub type_name: &'static str,
    pub message: String,
    pub span: Option<Span>,
}

/// Why evaluation stopped early.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    Raise(ScriptException),
    Abort(SandboxError),
}

impl Fault {
    pub fn raise(type_name: &'static str, message: impl Into<String>) -> Self {
        Fault::Raise(ScriptException {
            type_name,
            message: message.into(),
            span: None,
        })
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::raise("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::raise("ValueError", message)
    }

    pub fn overflow() -> Self {
        Self::raise("OverflowError", "integer overflow")
    }

    pub fn zero_division(message: &str) -> Self {
        Self::raise("ZeroDivisionError", message)
    }

    /// Record `span` as the location if none is known yet.
    pub fn at(self, span: Span) -> Self {
        match self {
            Fault::Raise(mut exc) => {
                exc.span.get_or_insert(span);
                Fault::Raise(exc)
            }
            Fault::Abort(err) => Fault::Abort(err.at(span)),
        }
    }

    /// Convert an uncaught fault into the engine error.
    pub fn into_error(self) -> SandboxError {
        match self {
            Fault::Raise(exc) => SandboxError::Runtime {
                error_type: exc.type_name.to_string(),
                message: exc.message,
                location: exc.span,
            },
            Fault::Abort(err) => err,
        }
    }
}

impl From<SandboxError> for Fault {
    fn from(err: SandboxError) -> Self {
        Fault::Abort(err)
    }
}

pub type EvalResult<T> = std::result::Result<T, Fault>;
