//! Capability framework: the only path from script code to side effects.
//!
//! A [`Capability`] is resolved once per worker (from a [`CapabilityCatalog`]
//! by path, or from a directly registered handle in duplicate-parent mode)
//! and invoked through the [`Dispatcher`], which applies validation, budgets,
//! token accounting and auditing around every call.

pub mod budget;
pub mod catalog;
pub mod dispatch;
pub mod spec;
pub mod tokens;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;
use crate::interp::Value;

pub use budget::{BudgetSpec, BudgetTracker};
pub use catalog::CapabilityCatalog;
pub use dispatch::{CapabilityStats, Dispatcher, LocalTokens, TokenClient};
pub use spec::CapabilitySpec;
pub use tokens::{ScopeBundle, TokenLedger, TokenSnapshot};

/// Plain JSON arguments of one capability call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, serde_json::Value>,
}

impl CallArgs {
    pub fn positional(args: Vec<serde_json::Value>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, key: &str, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.to_string(), value);
        self
    }

    /// Positional argument `index`, falling back to keyword `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&serde_json::Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    pub fn expect_len(&self, n: usize) -> Result<(), String> {
        let got = self.args.len() + self.kwargs.len();
        if got != n {
            return Err(format!("expected {n} argument(s), got {got}"));
        }
        Ok(())
    }

    pub fn str_at(&self, index: usize, name: &str) -> Result<&str, String> {
        match self.get(index, name) {
            Some(serde_json::Value::String(s)) => Ok(s),
            Some(other) => Err(format!("'{name}' must be a string, got {}", json_type(other))),
            None => Err(format!("missing argument '{name}'")),
        }
    }

    pub fn f64_at(&self, index: usize, name: &str) -> Result<f64, String> {
        match self.get(index, name) {
            Some(serde_json::Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| format!("'{name}' is not representable as a float")),
            Some(other) => Err(format!("'{name}' must be a number, got {}", json_type(other))),
            None => Err(format!("missing argument '{name}'")),
        }
    }

    pub fn i64_at(&self, index: usize, name: &str) -> Result<i64, String> {
        match self.get(index, name) {
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| format!("'{name}' must be an integer")),
            Some(other) => Err(format!("'{name}' must be an integer, got {}", json_type(other))),
            None => Err(format!("missing argument '{name}'")),
        }
    }

    /// Script-style repr of the positional arguments, cut at `limit` chars.
    pub fn args_repr(&self, limit: usize) -> String {
        let items: Vec<String> = self.args.iter().map(|v| Value::from_json(v).repr()).collect();
        let text = match items.len() {
            1 => format!("({},)", items[0]),
            _ => format!("({})", items.join(", ")),
        };
        truncate_chars(text, limit)
    }

    pub fn kwargs_repr(&self, limit: usize) -> String {
        let items: Vec<String> = self
            .kwargs
            .iter()
            .map(|(k, v)| format!("'{k}': {}", Value::from_json(v).repr()))
            .collect();
        truncate_chars(format!("{{{}}}", items.join(", ")), limit)
    }
}

fn truncate_chars(text: String, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text,
    }
}

fn json_type(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "None",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(n) if n.is_f64() => "float",
        serde_json::Value::Number(_) => "int",
        serde_json::Value::String(_) => "str",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "dict",
    }
}

/// Per-worker state produced by [`Capability::init`].
#[derive(Default)]
pub struct CapState(Option<Box<dyn Any + Send>>);

impl CapState {
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Some(Box::new(state)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.as_mut().and_then(|s| s.downcast_mut::<T>())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl std::fmt::Debug for CapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_some() { "CapState(..)" } else { "CapState(empty)" })
    }
}

/// A side effect exposed to scripts.
///
/// Errors are plain messages: `validate` failures surface as
/// `ArgumentError`, `call` and `serialize` failures as a catchable
/// `CapabilityError` inside the script.
pub trait Capability: Send + Sync {
    /// Runs once per worker before the first call.
    fn init(&self) -> Result<CapState, String> {
        Ok(CapState::empty())
    }

    fn validate(&self, _call: &CallArgs) -> Result<(), String> {
        Ok(())
    }

    fn call(&self, state: &mut CapState, call: &CallArgs) -> Result<serde_json::Value, String>;

    fn serialize(&self, value: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(value)
    }

    /// Runs at worker teardown, also after a fault.
    fn close(&self, _state: CapState) {}
}

type CallFn = dyn Fn(&CallArgs) -> Result<serde_json::Value, String> + Send + Sync;

/// Stateless capability backed by a closure.
pub struct FnCapability {
    func: Box<CallFn>,
}

impl Capability for FnCapability {
    fn call(&self, _state: &mut CapState, call: &CallArgs) -> Result<serde_json::Value, String> {
        (self.func)(call)
    }
}

pub fn from_fn<F>(func: F) -> Arc<dyn Capability>
where
    F: Fn(&CallArgs) -> Result<serde_json::Value, String> + Send + Sync + 'static,
{
    Arc::new(FnCapability {
        func: Box::new(func),
    })
}

/// Why a capability invocation did not return a value.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityFault {
    /// The effect itself failed; the script may catch it.
    Failed(String),
    /// A guard tripped; the execution stops.
    Abort(SandboxError),
}

impl From<SandboxError> for CapabilityFault {
    fn from(err: SandboxError) -> Self {
        CapabilityFault::Abort(err)
    }
}

/// The evaluator's view of the capability layer.
pub trait CapabilityInvoker {
    fn invoke(&mut self, name: &str, call: CallArgs) -> Result<serde_json::Value, CapabilityFault>;
}

/// Invoker for executions without capabilities.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCapabilities;

impl CapabilityInvoker for NoCapabilities {
    fn invoke(&mut self, name: &str, _call: CallArgs) -> Result<serde_json::Value, CapabilityFault> {
        Err(CapabilityFault::Abort(SandboxError::WorkerFault(format!(
            "capability '{name}' is not bound"
        ))))
    }
}
