//! Structured observability hooks for the execution lifecycle.
//!
//! - `ExecutionSpan` RAII guard tagging everything logged during one
//!   `execute` call with its `execution_id`
//! - emission functions for lifecycle events: started, rejected, worker
//!   spawned, worker fault, finished

use tracing::info;

/// RAII guard that enters an execution-scoped tracing span.
///
/// The span is exited when the guard drops, so it must not be held across
/// an `.await`; use [`ExecutionSpan::span`] with `Instrument` there.
pub struct ExecutionSpan {
    _span: tracing::span::EnteredSpan,
}

impl ExecutionSpan {
    /// Create and enter a span tagged with the execution id.
    pub fn enter(execution_id: &str) -> Self {
        Self {
            _span: Self::span(execution_id).entered(),
        }
    }

    /// The span itself, for instrumenting futures.
    pub fn span(execution_id: &str) -> tracing::Span {
        tracing::info_span!("cordon.execution", execution_id = %execution_id)
    }
}

/// Emit event: execution started.
pub fn emit_execution_started(execution_id: &str, mode: &str, code_bytes: usize) {
    info!(
        event = "execution.started",
        execution_id = %execution_id,
        mode = %mode,
        code_bytes = code_bytes,
    );
}

/// Emit event: execution rejected before a worker started.
pub fn emit_execution_rejected(execution_id: &str, kind: &str, message: &str) {
    info!(
        event = "execution.rejected",
        execution_id = %execution_id,
        kind = %kind,
        message = %message,
    );
}

/// Emit event: worker process launched.
pub fn emit_worker_spawned(execution_id: &str, pid: Option<u32>) {
    info!(event = "worker.spawned", execution_id = %execution_id, pid = ?pid);
}

/// Emit event: worker crashed or broke the protocol (warning level).
pub fn emit_worker_fault(execution_id: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "worker.fault", execution_id = %execution_id, error = %error);
}

/// Emit event: execution finished.
pub fn emit_execution_finished(execution_id: &str, duration_ms: u64, events: usize, ok: bool) {
    info!(
        event = "execution.finished",
        execution_id = %execution_id,
        duration_ms = duration_ms,
        events = events,
        ok = ok,
    );
}
