//! The record returned by every `execute` call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::audit::Event;
use crate::capability::{CapabilityStats, TokenSnapshot};
use crate::error::{BudgetDimension, ErrorInfo, ErrorKind};

/// Measurements of one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetrics {
    pub wall_ms: u64,
    pub ast_nodes: usize,
    pub steps: u64,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub user_ms: u64,
    pub sys_ms: u64,
    pub max_rss_kb: u64,
    pub capabilities: BTreeMap<String, CapabilityStats>,
}

impl RunMetrics {
    pub fn capability_calls(&self) -> u64 {
        self.capabilities.values().map(|s| s.calls).sum()
    }
}

/// `stats` of a result: the script's `__stats__` plus the token scopes left
/// after the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub user: serde_json::Value,
    pub token_scopes: TokenSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    pub ok: bool,
    pub result: serde_json::Value,
    pub locals: serde_json::Map<String, serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub events: Vec<Event>,
    pub metrics: RunMetrics,
    pub stats: RunStats,
}

impl SandboxResult {
    /// A failure that happened before any worker ran.
    pub fn rejected(error: ErrorInfo, token_scopes: TokenSnapshot) -> Self {
        Self::failed(error, Vec::new(), RunMetrics::default(), token_scopes)
    }

    pub fn failed(
        error: ErrorInfo,
        events: Vec<Event>,
        metrics: RunMetrics,
        token_scopes: TokenSnapshot,
    ) -> Self {
        Self {
            ok: false,
            result: serde_json::Value::Null,
            locals: serde_json::Map::new(),
            error: Some(error),
            events,
            metrics,
            stats: RunStats {
                user: serde_json::Value::Null,
                token_scopes,
            },
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn budget_dimension(&self) -> Option<BudgetDimension> {
        self.error.as_ref().and_then(ErrorInfo::budget_dimension)
    }

    /// Events of one type, in order.
    pub fn events_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    /// Everything the script printed to stdout.
    pub fn stdout(&self) -> String {
        self.events_of("stdout")
            .filter_map(|e| e.data.get("text").and_then(|t| t.as_str()))
            .collect()
    }
}
