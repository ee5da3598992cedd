use serde::{Deserialize, Serialize};

use super::budget::BudgetSpec;

fn default_arg_repr_limit() -> usize {
    400
}

/// Declarative description of one capability binding.
///
/// `path` names a catalog entry (e.g. `text:upper`) and works in every
/// mode. Without a path the capability must be registered directly on the
/// environment, which only duplicate-parent workers can see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySpec {
    /// Name bound in the script's globals.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub budget: BudgetSpec,
    #[serde(default)]
    pub tokens_per_call: u64,
    #[serde(default)]
    pub tokens_per_byte: f64,
    #[serde(default = "default_arg_repr_limit")]
    pub arg_repr_limit: usize,
}

impl CapabilitySpec {
    /// A capability resolved from the catalog entry at `path`.
    pub fn from_path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::registered(name)
        }
    }

    /// A capability supplied through the environment's registry.
    pub fn registered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            budget: BudgetSpec::default(),
            tokens_per_call: 0,
            tokens_per_byte: 0.0,
            arg_repr_limit: default_arg_repr_limit(),
        }
    }

    pub fn with_budget(mut self, budget: BudgetSpec) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_tokens(mut self, per_call: u64, per_byte: f64) -> Self {
        self.tokens_per_call = per_call;
        self.tokens_per_byte = per_byte;
        self
    }

    pub fn with_arg_repr_limit(mut self, limit: usize) -> Self {
        self.arg_repr_limit = limit;
        self
    }

    /// Tokens charged for a call that returned `bytes_out` bytes.
    pub fn token_cost(&self, bytes_out: u64) -> u64 {
        let per_byte = (self.tokens_per_byte * bytes_out as f64).floor();
        let per_byte = if per_byte.is_finite() && per_byte > 0.0 {
            per_byte as u64
        } else {
            0
        };
        self.tokens_per_call.saturating_add(per_byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let spec: CapabilitySpec =
            serde_json::from_value(serde_json::json!({"name": "upper", "path": "text:upper"})).unwrap();
        assert_eq!(spec.arg_repr_limit, 400);
        assert_eq!(spec.budget.max_calls, Some(100));
        assert_eq!(spec.tokens_per_call, 0);
    }

    #[test]
    fn test_token_cost_floors_per_byte_share() {
        let spec = CapabilitySpec::registered("x").with_tokens(2, 0.5);
        assert_eq!(spec.token_cost(0), 2);
        assert_eq!(spec.token_cost(5), 4);
        assert_eq!(spec.token_cost(7), 5);
    }
}
