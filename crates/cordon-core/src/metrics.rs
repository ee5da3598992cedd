//! Global atomic counters for sandbox observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton. Only the host process updates it; worker
/// activity is folded in from the metrics each worker returns.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    executions: AtomicU64,
    policy_rejections: AtomicU64,
    timeouts: AtomicU64,
    worker_faults: AtomicU64,
    capability_calls: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            executions: AtomicU64::new(0),
            policy_rejections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            worker_faults: AtomicU64::new(0),
            capability_calls: AtomicU64::new(0),
        }
    }

    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions", "counter incremented");
    }

    /// Executions stopped by the static checker or input validation.
    pub fn inc_policy_rejections(&self) {
        self.policy_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "policy_rejections", "counter incremented");
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "timeouts", "counter incremented");
    }

    pub fn inc_worker_faults(&self) {
        self.worker_faults.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "worker_faults", "counter incremented");
    }

    pub fn add_capability_calls(&self, n: u64) {
        if n > 0 {
            self.capability_calls.fetch_add(n, Ordering::Relaxed);
            tracing::trace!(metric = "capability_calls", n, "counter incremented");
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            executions = self.executions(),
            policy_rejections = self.policy_rejections(),
            timeouts = self.timeouts(),
            worker_faults = self.worker_faults(),
            capability_calls = self.capability_calls(),
        );
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn policy_rejections(&self) -> u64 {
        self.policy_rejections.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    pub fn worker_faults(&self) -> u64 {
        self.worker_faults.load(Ordering::Relaxed)
    }

    pub fn capability_calls(&self) -> u64 {
        self.capability_calls.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.executions.store(0, Ordering::Relaxed);
        self.policy_rejections.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.worker_faults.store(0, Ordering::Relaxed);
        self.capability_calls.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = Metrics::new();
        m.inc_executions();
        m.inc_executions();
        assert_eq!(m.executions(), 2);

        m.inc_policy_rejections();
        m.inc_timeouts();
        m.inc_worker_faults();
        assert_eq!(m.policy_rejections(), 1);
        assert_eq!(m.timeouts(), 1);
        assert_eq!(m.worker_faults(), 1);

        m.add_capability_calls(0);
        m.add_capability_calls(3);
        assert_eq!(m.capability_calls(), 3);
    }

    #[test]
    fn test_reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_executions();
        m.inc_timeouts();
        m.add_capability_calls(5);
        m.reset();
        assert_eq!(m.executions(), 0);
        assert_eq!(m.timeouts(), 0);
        assert_eq!(m.capability_calls(), 0);
    }
}
