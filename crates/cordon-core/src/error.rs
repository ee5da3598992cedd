//! Error taxonomy for the sandbox engine.
//!
//! [`SandboxError`] is the in-process error type. [`ErrorInfo`] is its
//! serialisable projection, carried across the worker protocol and returned
//! to callers inside a [`crate::result::SandboxResult`].

use std::collections::BTreeMap;

use cordon_script::{excerpt, Span, SyntaxError};
use serde::{Deserialize, Serialize};

use crate::i18n;

/// Which budget dimension a capability exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Calls,
    Time,
    Rate,
    Bandwidth,
    Bytes,
}

impl std::fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BudgetDimension::Calls => "calls",
            BudgetDimension::Time => "time",
            BudgetDimension::Rate => "rate",
            BudgetDimension::Bandwidth => "bandwidth",
            BudgetDimension::Bytes => "bytes",
        };
        f.write_str(s)
    }
}

/// OS-level resource that hit its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    OpenFiles,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::OpenFiles => "open_files",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaStage {
    Input,
    Output,
}

impl std::fmt::Display for SchemaStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SchemaStage::Input => "input",
            SchemaStage::Output => "output",
        })
    }
}

/// Pipeline stage at which an execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parse,
    Policy,
    Schema,
    Runtime,
    Timeout,
    Worker,
}

/// Stable error kind names exposed in results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    SyntaxError,
    PolicyViolation,
    ArgumentError,
    BudgetExceeded,
    TokenExhausted,
    StepBudgetExceeded,
    RecursionExceeded,
    Timeout,
    ResourceLimitExceeded,
    SchemaValidationError,
    WorkerFault,
    SerializationError,
    RuntimeError,
    InvalidConfig,
}

/// Errors produced by the sandbox engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("syntax error: {message}")]
    Syntax {
        message: String,
        location: Option<Span>,
    },

    #[error("policy violation: {message}")]
    PolicyViolation {
        node: String,
        message: String,
        location: Option<Span>,
    },

    #[error("invalid arguments for capability '{capability}': {message}")]
    ArgumentError { capability: String, message: String },

    #[error("capability '{capability}' exceeded its {dimension} budget ({limit})")]
    BudgetExceeded {
        capability: String,
        dimension: BudgetDimension,
        limit: String,
    },

    #[error("token budget exhausted for '{capability}': needed {needed}, available {available}")]
    TokenExhausted {
        capability: String,
        needed: u64,
        available: u64,
    },

    #[error("step budget exceeded (max_steps={limit})")]
    StepBudgetExceeded { limit: u64, location: Option<Span> },

    #[error("maximum recursion depth exceeded (max_recursion={limit})")]
    RecursionExceeded {
        limit: usize,
        location: Option<Span>,
    },

    #[error("execution timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("{resource} limit exceeded: {message}")]
    ResourceLimitExceeded {
        resource: ResourceKind,
        message: String,
        location: Option<Span>,
    },

    #[error("{stage} schema validation failed at {path}: {message}")]
    SchemaValidation {
        stage: SchemaStage,
        path: String,
        message: String,
    },

    #[error("worker fault: {0}")]
    WorkerFault(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{error_type}: {message}")]
    Runtime {
        error_type: String,
        message: String,
        location: Option<Span>,
    },

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for sandbox operations.
pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

impl From<SyntaxError> for SandboxError {
    fn from(err: SyntaxError) -> Self {
        SandboxError::Syntax {
            message: err.message,
            location: Some(err.span),
        }
    }
}

impl SandboxError {
    pub fn policy(node: &str, message: impl Into<String>, location: Span) -> Self {
        SandboxError::PolicyViolation {
            node: node.to_string(),
            message: message.into(),
            location: Some(location),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Syntax { .. } => ErrorKind::SyntaxError,
            SandboxError::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            SandboxError::ArgumentError { .. } => ErrorKind::ArgumentError,
            SandboxError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            SandboxError::TokenExhausted { .. } => ErrorKind::TokenExhausted,
            SandboxError::StepBudgetExceeded { .. } => ErrorKind::StepBudgetExceeded,
            SandboxError::RecursionExceeded { .. } => ErrorKind::RecursionExceeded,
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::ResourceLimitExceeded { .. } => ErrorKind::ResourceLimitExceeded,
            SandboxError::SchemaValidation { .. } => ErrorKind::SchemaValidationError,
            SandboxError::WorkerFault(_) => ErrorKind::WorkerFault,
            SandboxError::Serialization(_) => ErrorKind::SerializationError,
            SandboxError::Runtime { .. } => ErrorKind::RuntimeError,
            SandboxError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            SandboxError::Syntax { .. } => Stage::Parse,
            SandboxError::PolicyViolation { .. } => Stage::Policy,
            SandboxError::SchemaValidation { .. } => Stage::Schema,
            SandboxError::Timeout { .. } => Stage::Timeout,
            SandboxError::WorkerFault(_) | SandboxError::InvalidConfig(_) => Stage::Worker,
            _ => Stage::Runtime,
        }
    }

    pub fn location(&self) -> Option<Span> {
        match self {
            SandboxError::Syntax { location, .. }
            | SandboxError::PolicyViolation { location, .. }
            | SandboxError::StepBudgetExceeded { location, .. }
            | SandboxError::RecursionExceeded { location, .. }
            | SandboxError::ResourceLimitExceeded { location, .. }
            | SandboxError::Runtime { location, .. } => *location,
            _ => None,
        }
    }

    /// Attach a location to errors that carry one, keeping an existing one.
    pub fn at(mut self, span: Span) -> Self {
        match &mut self {
            SandboxError::StepBudgetExceeded { location, .. }
            | SandboxError::RecursionExceeded { location, .. }
            | SandboxError::ResourceLimitExceeded { location, .. }
            | SandboxError::Runtime { location, .. } => {
                location.get_or_insert(span);
            }
            _ => {}
        }
        self
    }

    fn detail(&self) -> Option<serde_json::Value> {
        let value = match self {
            SandboxError::PolicyViolation { node, .. } => serde_json::json!({ "node": node }),
            SandboxError::ArgumentError { capability, .. } => {
                serde_json::json!({ "capability": capability })
            }
            SandboxError::BudgetExceeded {
                capability,
                dimension,
                limit,
            } => serde_json::json!({
                "capability": capability,
                "dimension": dimension,
                "limit": limit,
            }),
            SandboxError::TokenExhausted {
                capability,
                needed,
                available,
            } => serde_json::json!({
                "capability": capability,
                "needed": needed,
                "available": available,
            }),
            SandboxError::StepBudgetExceeded { limit, .. } => serde_json::json!({ "limit": limit }),
            SandboxError::RecursionExceeded { limit, .. } => serde_json::json!({ "limit": limit }),
            SandboxError::Timeout { limit_ms } => serde_json::json!({ "limit_ms": limit_ms }),
            SandboxError::ResourceLimitExceeded { resource, .. } => {
                serde_json::json!({ "resource": resource })
            }
            SandboxError::SchemaValidation { stage, path, .. } => {
                serde_json::json!({ "stage": stage, "path": path })
            }
            _ => return None,
        };
        Some(value)
    }

    fn bare_message(&self) -> String {
        match self {
            SandboxError::Syntax { message, .. }
            | SandboxError::PolicyViolation { message, .. }
            | SandboxError::Runtime { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Serialisable description of a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub stage: Stage,
    /// Script exception type for runtime errors, otherwise the kind name.
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    /// Stable key for localising `message`, see [`crate::i18n`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub message_params: BTreeMap<String, String>,
}

impl ErrorInfo {
    /// Build from an error, attaching a source excerpt when a location and
    /// the source text are both available.
    pub fn from_error(err: &SandboxError, source: Option<&str>) -> Self {
        let kind = err.kind();
        let error_type = match err {
            SandboxError::Runtime { error_type, .. } => error_type.clone(),
            _ => format!("{kind:?}"),
        };
        let location = err.location();
        let snippet = match (location, source) {
            (Some(span), Some(src)) => excerpt(src, span),
            _ => None,
        };
        let (message_key, message_params) = match i18n::message_key(err) {
            Some((key, params)) => (Some(key.to_string()), params),
            None => (None, BTreeMap::new()),
        };
        Self {
            kind,
            stage: err.stage(),
            error_type,
            message: err.bare_message(),
            lineno: location.map(|s| s.line),
            col: location.map(|s| s.col),
            excerpt: snippet.as_ref().map(|e| e.text.clone()),
            caret: snippet.map(|e| e.caret),
            detail: err.detail(),
            message_key,
            message_params,
        }
    }

    /// Dimension recorded for a `BudgetExceeded` error.
    pub fn budget_dimension(&self) -> Option<BudgetDimension> {
        let value = self.detail.as_ref()?.get("dimension")?.clone();
        serde_json::from_value(value).ok()
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)?;
        if let (Some(line), Some(col)) = (self.lineno, self.col) {
            write!(f, " (line {line}, col {col})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_error_info_has_excerpt() {
        let src = "x = 1\nimport os\n";
        let err = SandboxError::policy("Import", "import is not allowed", Span::new(2, 1));
        let info = ErrorInfo::from_error(&err, Some(src));
        assert_eq!(info.kind, ErrorKind::PolicyViolation);
        assert_eq!(info.stage, Stage::Policy);
        assert_eq!(info.lineno, Some(2));
        assert_eq!(info.excerpt.as_deref(), Some("import os"));
        assert_eq!(info.caret.as_deref(), Some("^"));
        assert_eq!(info.message, "import is not allowed");
    }

    #[test]
    fn test_budget_dimension_round_trips_through_detail() {
        let err = SandboxError::BudgetExceeded {
            capability: "fetch".into(),
            dimension: BudgetDimension::Rate,
            limit: "max_qps=1".into(),
        };
        let info = ErrorInfo::from_error(&err, None);
        assert_eq!(info.budget_dimension(), Some(BudgetDimension::Rate));
        assert_eq!(info.error_type, "BudgetExceeded");
    }

    #[test]
    fn test_runtime_error_uses_script_type() {
        let err = SandboxError::Runtime {
            error_type: "ZeroDivisionError".into(),
            message: "division by zero".into(),
            location: Some(Span::new(1, 5)),
        };
        let info = ErrorInfo::from_error(&err, Some("x = 1 / 0"));
        assert_eq!(info.error_type, "ZeroDivisionError");
        assert_eq!(info.caret.as_deref(), Some("    ^"));
        assert_eq!(info.to_string(), "ZeroDivisionError: division by zero (line 1, col 5)");
    }

    #[test]
    fn test_at_keeps_first_location() {
        let err = SandboxError::StepBudgetExceeded {
            limit: 10,
            location: None,
        }
        .at(Span::new(3, 1))
        .at(Span::new(9, 9));
        assert_eq!(err.location(), Some(Span::new(3, 1)));
    }

    #[test]
    fn test_stage_mapping() {
        assert_eq!(SandboxError::Timeout { limit_ms: 5 }.stage(), Stage::Timeout);
        assert_eq!(SandboxError::WorkerFault("x".into()).stage(), Stage::Worker);
        assert_eq!(
            SandboxError::Serialization("nan".into()).stage(),
            Stage::Runtime
        );
    }
}
