//! Per-capability budgets.
//!
//! Checks split around the effect: [`BudgetTracker::admit`] runs before it
//! (calls, rate, accumulated time) and [`BudgetTracker::settle`] after it
//! (call time, return size, totals, bandwidth). Times come from the worker
//! clock, so a fake clock makes every budget decision reproducible.

use serde::{Deserialize, Serialize};

use crate::error::{BudgetDimension, Result, SandboxError};

/// Limits for one capability over one execution. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSpec {
    pub max_calls: Option<u64>,
    pub max_total_ms: Option<u64>,
    /// Calls per second.
    pub max_qps: Option<f64>,
    /// Output bytes per second.
    pub max_bandwidth: Option<u64>,
    pub max_ret_bytes: Option<u64>,
    pub max_call_ms: Option<u64>,
    pub max_total_bytes: Option<u64>,
    /// Initial exec-scope tokens when the caller left that scope unset.
    pub max_tokens: Option<u64>,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            max_calls: Some(100),
            max_total_ms: Some(200),
            max_qps: None,
            max_bandwidth: None,
            max_ret_bytes: Some(200_000),
            max_call_ms: None,
            max_total_bytes: None,
            max_tokens: None,
        }
    }
}

impl BudgetSpec {
    pub fn unlimited() -> Self {
        Self {
            max_calls: None,
            max_total_ms: None,
            max_qps: None,
            max_bandwidth: None,
            max_ret_bytes: None,
            max_call_ms: None,
            max_total_bytes: None,
            max_tokens: None,
        }
    }

    pub fn with_max_calls(mut self, n: u64) -> Self {
        self.max_calls = Some(n);
        self
    }

    pub fn with_max_qps(mut self, qps: f64) -> Self {
        self.max_qps = Some(qps);
        self
    }

    pub fn with_max_bandwidth(mut self, bytes_per_sec: u64) -> Self {
        self.max_bandwidth = Some(bytes_per_sec);
        self
    }

    pub fn with_max_ret_bytes(mut self, bytes: u64) -> Self {
        self.max_ret_bytes = Some(bytes);
        self
    }

    pub fn with_max_total_bytes(mut self, bytes: u64) -> Self {
        self.max_total_bytes = Some(bytes);
        self
    }

    pub fn with_max_call_ms(mut self, ms: u64) -> Self {
        self.max_call_ms = Some(ms);
        self
    }

    pub fn with_max_total_ms(mut self, ms: u64) -> Self {
        self.max_total_ms = Some(ms);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u64) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn validate(&self, capability: &str) -> Result<()> {
        if let Some(qps) = self.max_qps {
            if !(qps.is_finite() && qps > 0.0) {
                return Err(SandboxError::InvalidConfig(format!(
                    "capability '{capability}': max_qps must be a positive number"
                )));
            }
        }
        Ok(())
    }
}

/// Continuously refilled bucket holding one second's allowance.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate: f64,
    level: f64,
    last: f64,
}

impl TokenBucket {
    /// A full bucket refilling at `rate` units per second.
    pub fn new(rate: f64, now: f64) -> Self {
        let capacity = rate.max(1.0);
        Self {
            capacity,
            rate,
            level: capacity,
            last: now,
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last).max(0.0);
        self.level = (self.level + elapsed * self.rate).min(self.capacity);
        self.last = now;
    }

    /// Take `amount` units if available.
    pub fn try_take(&mut self, amount: f64, now: f64) -> bool {
        self.refill(now);
        if self.level + f64::EPSILON < amount {
            return false;
        }
        self.level -= amount;
        true
    }
}

/// Running usage of one capability against its [`BudgetSpec`].
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    capability: String,
    spec: BudgetSpec,
    calls: u64,
    total_ms: u64,
    total_bytes: u64,
    rate: Option<TokenBucket>,
    bandwidth: Option<TokenBucket>,
}

impl BudgetTracker {
    pub fn new(capability: &str, spec: &BudgetSpec, now: f64) -> Self {
        Self {
            capability: capability.to_string(),
            spec: spec.clone(),
            calls: 0,
            total_ms: 0,
            total_bytes: 0,
            rate: spec.max_qps.map(|qps| TokenBucket::new(qps, now)),
            bandwidth: spec.max_bandwidth.map(|bw| TokenBucket::new(bw as f64, now)),
        }
    }

    fn exceeded(&self, dimension: BudgetDimension, limit: String) -> SandboxError {
        SandboxError::BudgetExceeded {
            capability: self.capability.clone(),
            dimension,
            limit,
        }
    }

    /// Pre-effect checks. Counts the call when admitted.
    pub fn admit(&mut self, now: f64) -> Result<()> {
        if let Some(max) = self.spec.max_calls {
            if self.calls >= max {
                return Err(self.exceeded(BudgetDimension::Calls, format!("max_calls={max}")));
            }
        }
        if let Some(max) = self.spec.max_total_ms {
            if self.total_ms >= max {
                return Err(self.exceeded(BudgetDimension::Time, format!("max_total_ms={max}")));
            }
        }
        if let Some(bucket) = self.rate.as_mut() {
            if !bucket.try_take(1.0, now) {
                let qps = self.spec.max_qps.unwrap_or_default();
                return Err(self.exceeded(BudgetDimension::Rate, format!("max_qps={qps}")));
            }
        }
        self.calls += 1;
        Ok(())
    }

    /// Post-effect checks for a call that took `ms` and returned `bytes`.
    pub fn settle(&mut self, ms: u64, bytes: u64, now: f64) -> Result<()> {
        if let Some(max) = self.spec.max_call_ms {
            if ms > max {
                return Err(self.exceeded(BudgetDimension::Time, format!("max_call_ms={max}")));
            }
        }
        if let Some(max) = self.spec.max_ret_bytes {
            if bytes > max {
                return Err(self.exceeded(BudgetDimension::Bytes, format!("max_ret_bytes={max}")));
            }
        }
        self.total_ms = self.total_ms.saturating_add(ms);
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        if let Some(max) = self.spec.max_total_ms {
            if self.total_ms > max {
                return Err(self.exceeded(BudgetDimension::Time, format!("max_total_ms={max}")));
            }
        }
        if let Some(max) = self.spec.max_total_bytes {
            if self.total_bytes > max {
                return Err(self.exceeded(
                    BudgetDimension::Bytes,
                    format!("max_total_bytes={max}"),
                ));
            }
        }
        if let Some(bucket) = self.bandwidth.as_mut() {
            if !bucket.try_take(bytes as f64, now) {
                let bw = self.spec.max_bandwidth.unwrap_or_default();
                return Err(self.exceeded(
                    BudgetDimension::Bandwidth,
                    format!("max_bandwidth={bw}"),
                ));
            }
        }
        Ok(())
    }

    /// Account time spent by a call whose effect failed.
    pub fn record_failure(&mut self, ms: u64) {
        self.total_ms = self.total_ms.saturating_add(ms);
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dimension(err: SandboxError) -> BudgetDimension {
        match err {
            SandboxError::BudgetExceeded { dimension, .. } => dimension,
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_defaults_and_unlimited() {
        let spec = BudgetSpec::default();
        assert_eq!(spec.max_calls, Some(100));
        assert_eq!(spec.max_total_ms, Some(200));
        assert_eq!(spec.max_ret_bytes, Some(200_000));
        assert!(spec.max_qps.is_none());
        assert_eq!(BudgetSpec::unlimited().max_calls, None);
    }

    #[test]
    fn test_call_limit() {
        let mut t = BudgetTracker::new("c", &BudgetSpec::unlimited().with_max_calls(2), 0.0);
        t.admit(0.0).unwrap();
        t.admit(0.0).unwrap();
        assert_eq!(dimension(t.admit(0.0).unwrap_err()), BudgetDimension::Calls);
        assert_eq!(t.calls(), 2);
    }

    #[test]
    fn test_rate_bucket_refills_from_clock() {
        let mut t = BudgetTracker::new("c", &BudgetSpec::unlimited().with_max_qps(2.0), 0.0);
        t.admit(0.0).unwrap();
        t.admit(0.0).unwrap();
        assert_eq!(dimension(t.admit(0.0).unwrap_err()), BudgetDimension::Rate);
        t.admit(0.5).unwrap();
    }

    #[test]
    fn test_fractional_rate_still_admits_one_call() {
        let mut t = BudgetTracker::new("c", &BudgetSpec::unlimited().with_max_qps(0.5), 0.0);
        t.admit(0.0).unwrap();
        assert_eq!(dimension(t.admit(1.0).unwrap_err()), BudgetDimension::Rate);
        t.admit(2.0).unwrap();
    }

    #[test]
    fn test_settle_dimensions() {
        let spec = BudgetSpec::unlimited().with_max_ret_bytes(10).with_max_call_ms(5);
        let mut t = BudgetTracker::new("c", &spec, 0.0);
        assert_eq!(dimension(t.settle(6, 1, 0.0).unwrap_err()), BudgetDimension::Time);
        assert_eq!(dimension(t.settle(1, 11, 0.0).unwrap_err()), BudgetDimension::Bytes);

        let spec = BudgetSpec::unlimited().with_max_total_bytes(10);
        let mut t = BudgetTracker::new("c", &spec, 0.0);
        t.settle(0, 6, 0.0).unwrap();
        assert_eq!(dimension(t.settle(0, 6, 0.0).unwrap_err()), BudgetDimension::Bytes);
    }

    #[test]
    fn test_bandwidth_bucket() {
        let spec = BudgetSpec::unlimited().with_max_bandwidth(100);
        let mut t = BudgetTracker::new("c", &spec, 0.0);
        t.settle(0, 80, 0.0).unwrap();
        assert_eq!(dimension(t.settle(0, 80, 0.1).unwrap_err()), BudgetDimension::Bandwidth);
        t.settle(0, 80, 1.0).unwrap();
    }

    #[test]
    fn test_total_time_blocks_next_admission() {
        let spec = BudgetSpec::unlimited().with_max_total_ms(10);
        let mut t = BudgetTracker::new("c", &spec, 0.0);
        t.admit(0.0).unwrap();
        t.settle(10, 0, 0.0).unwrap();
        assert_eq!(dimension(t.admit(0.0).unwrap_err()), BudgetDimension::Time);
    }
}
