//! Worker-side capability dispatch.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{CallArgs, CapState, Capability, CapabilityFault, CapabilityInvoker, CapabilitySpec};
use super::budget::BudgetTracker;
use super::tokens::ScopeBundle;
use crate::audit::{AuditStream, Event};
use crate::error::{Result, SandboxError};
use crate::guard::Clock;
use crate::serialize::approx_bytes;

/// Where a worker draws capability tokens from.
pub trait TokenClient {
    /// Consume `n` tokens for `capability`. `init_exec` seeds an unset exec
    /// scope first.
    fn consume(&mut self, capability: &str, n: u64, init_exec: Option<u64>) -> Result<()>;
}

/// Tokens drawn directly from in-process ledgers.
#[derive(Debug, Clone)]
pub struct LocalTokens {
    scopes: ScopeBundle,
}

impl LocalTokens {
    pub fn new(scopes: ScopeBundle) -> Self {
        Self { scopes }
    }

    pub fn scopes(&self) -> &ScopeBundle {
        &self.scopes
    }
}

impl TokenClient for LocalTokens {
    fn consume(&mut self, capability: &str, n: u64, init_exec: Option<u64>) -> Result<()> {
        if let Some(tokens) = init_exec {
            self.scopes.init_exec(tokens);
        }
        self.scopes.consume(capability, n)
    }
}

/// Usage of one capability during an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityStats {
    pub calls: u64,
    pub ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

struct Slot {
    spec: CapabilitySpec,
    handle: Arc<dyn Capability>,
    state: Option<CapState>,
    tracker: BudgetTracker,
    stats: CapabilityStats,
}

#[derive(Default)]
struct CallRecord {
    ms: u64,
    bytes_out: u64,
    tokens: u64,
}

/// Routes script calls through validation, budgets, tokens and auditing.
pub struct Dispatcher {
    slots: BTreeMap<String, Slot>,
    audit: Rc<AuditStream>,
    clock: Rc<Clock>,
    tokens: Box<dyn TokenClient>,
}

impl Dispatcher {
    /// Bind resolved capabilities and run their `init` hooks.
    ///
    /// A failing `init` closes the capabilities initialised before it.
    pub fn new(
        bound: Vec<(CapabilitySpec, Arc<dyn Capability>)>,
        audit: Rc<AuditStream>,
        clock: Rc<Clock>,
        tokens: Box<dyn TokenClient>,
    ) -> Result<Self> {
        let mut dispatcher = Self {
            slots: BTreeMap::new(),
            audit,
            clock,
            tokens,
        };
        for (spec, handle) in bound {
            spec.budget.validate(&spec.name)?;
            let state = handle.init().map_err(|e| {
                SandboxError::WorkerFault(format!("capability '{}' init failed: {e}", spec.name))
            })?;
            let tracker = BudgetTracker::new(&spec.name, &spec.budget, dispatcher.clock.elapsed_secs());
            dispatcher.slots.insert(
                spec.name.clone(),
                Slot {
                    spec,
                    handle,
                    state: Some(state),
                    tracker,
                    stats: CapabilityStats::default(),
                },
            );
        }
        Ok(dispatcher)
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    pub fn stats(&self) -> BTreeMap<String, CapabilityStats> {
        self.slots
            .iter()
            .map(|(name, slot)| (name.clone(), slot.stats))
            .collect()
    }

    /// Run every `close` hook once.
    pub fn close(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(state) = slot.state.take() {
                slot.handle.close(state);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn span_ms(start: f64, end: f64) -> u64 {
    ((end - start) * 1000.0).max(0.0) as u64
}

fn run_call(
    slot: &mut Slot,
    call: &CallArgs,
    clock: &Clock,
    tokens: &mut dyn TokenClient,
    record: &mut CallRecord,
) -> std::result::Result<serde_json::Value, CapabilityFault> {
    let name = slot.spec.name.as_str();
    slot.handle
        .validate(call)
        .map_err(|message| SandboxError::ArgumentError {
            capability: name.to_string(),
            message,
        })?;
    slot.tracker.admit(clock.elapsed_secs())?;

    let state = slot.state.get_or_insert_with(CapState::empty);
    let start = clock.elapsed_secs();
    let effect = slot
        .handle
        .call(state, call)
        .and_then(|value| slot.handle.serialize(value));
    record.ms = span_ms(start, clock.elapsed_secs());
    let value = match effect {
        Ok(value) => value,
        Err(message) => {
            slot.tracker.record_failure(record.ms);
            return Err(CapabilityFault::Failed(message));
        }
    };

    record.bytes_out = approx_bytes(&value);
    slot.tracker
        .settle(record.ms, record.bytes_out, clock.elapsed_secs())?;
    let cost = slot.spec.token_cost(record.bytes_out);
    tokens.consume(name, cost, slot.spec.budget.max_tokens)?;
    record.tokens = cost;
    Ok(value)
}

impl CapabilityInvoker for Dispatcher {
    fn invoke(
        &mut self,
        name: &str,
        call: CallArgs,
    ) -> std::result::Result<serde_json::Value, CapabilityFault> {
        let Some(slot) = self.slots.get_mut(name) else {
            return Err(CapabilityFault::Abort(SandboxError::WorkerFault(format!(
                "capability '{name}' is not bound"
            ))));
        };
        let bytes_in = approx_bytes(&serde_json::Value::Array(call.args.clone()))
            + approx_bytes(&serde_json::Value::Object(call.kwargs.clone().into_iter().collect()));
        let mut record = CallRecord::default();
        let outcome = run_call(slot, &call, &self.clock, self.tokens.as_mut(), &mut record);

        slot.stats.calls += 1;
        slot.stats.ms += record.ms;
        slot.stats.bytes_in += bytes_in;
        slot.stats.bytes_out += record.bytes_out;

        let limit = slot.spec.arg_repr_limit;
        let mut data = json!({
            "name": name,
            "ok": outcome.is_ok(),
            "ms": record.ms,
            "bytes_in": bytes_in,
            "bytes_out": record.bytes_out,
            "tokens": record.tokens,
            "args": call.args_repr(limit),
            "kwargs": call.kwargs_repr(limit),
        });
        if let Err(fault) = &outcome {
            let error = match fault {
                CapabilityFault::Failed(message) => format!("CapabilityError: {message}"),
                CapabilityFault::Abort(err) => format!("{:?}: {err}", err.kind()),
            };
            tracing::debug!(event = "capability.failed", capability = %name, error = %error);
            data["error"] = json!(error);
        }
        self.audit
            .emit(Event::new(self.clock.elapsed_ms(), "cap", data));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::budget::BudgetSpec;
    use crate::capability::from_fn;
    use crate::capability::tokens::TokenLedger;
    use crate::error::BudgetDimension;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo() -> Arc<dyn Capability> {
        from_fn(|call| Ok(call.args.first().cloned().unwrap_or(serde_json::Value::Null)))
    }

    fn dispatcher(
        bound: Vec<(CapabilitySpec, Arc<dyn Capability>)>,
        scopes: ScopeBundle,
    ) -> (Dispatcher, Rc<AuditStream>) {
        let audit = Rc::new(AuditStream::in_memory());
        let clock = Rc::new(Clock::fake(0.0, 0.0));
        let d = Dispatcher::new(bound, audit.clone(), clock, Box::new(LocalTokens::new(scopes)))
            .unwrap();
        (d, audit)
    }

    fn abort(fault: CapabilityFault) -> SandboxError {
        match fault {
            CapabilityFault::Abort(err) => err,
            other => panic!("expected Abort, got {other:?}"),
        }
    }

    #[test]
    fn test_successful_call_emits_one_event() {
        let spec = CapabilitySpec::registered("echo").with_tokens(1, 0.0);
        let (mut d, audit) = dispatcher(vec![(spec, echo())], ScopeBundle::unlimited());
        let out = d
            .invoke("echo", CallArgs::positional(vec![json!("hello")]))
            .unwrap();
        assert_eq!(out, json!("hello"));

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "cap");
        assert_eq!(events[0].data["name"], json!("echo"));
        assert_eq!(events[0].data["ok"], json!(true));
        assert_eq!(events[0].data["args"], json!("('hello',)"));
        assert_eq!(events[0].data["bytes_out"], json!(5));
        assert_eq!(events[0].data["tokens"], json!(1));
        assert_eq!(d.stats()["echo"].calls, 1);
    }

    #[test]
    fn test_validation_failure_is_argument_error() {
        struct Strict;
        impl Capability for Strict {
            fn validate(&self, call: &CallArgs) -> std::result::Result<(), String> {
                call.expect_len(1)
            }
            fn call(
                &self,
                _state: &mut CapState,
                _call: &CallArgs,
            ) -> std::result::Result<serde_json::Value, String> {
                Ok(serde_json::Value::Null)
            }
        }
        let (mut d, audit) = dispatcher(
            vec![(CapabilitySpec::registered("strict"), Arc::new(Strict))],
            ScopeBundle::unlimited(),
        );
        let err = abort(d.invoke("strict", CallArgs::default()).unwrap_err());
        match err {
            SandboxError::ArgumentError { capability, .. } => assert_eq!(capability, "strict"),
            other => panic!("expected ArgumentError, got {other:?}"),
        }
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["ok"], json!(false));
    }

    #[test]
    fn test_rate_limit_only() {
        let spec = CapabilitySpec::registered("echo")
            .with_budget(BudgetSpec::unlimited().with_max_qps(2.0));
        let (mut d, _) = dispatcher(vec![(spec, echo())], ScopeBundle::unlimited());
        d.invoke("echo", CallArgs::default()).unwrap();
        d.invoke("echo", CallArgs::default()).unwrap();
        match abort(d.invoke("echo", CallArgs::default()).unwrap_err()) {
            SandboxError::BudgetExceeded { dimension, .. } => {
                assert_eq!(dimension, BudgetDimension::Rate)
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[test]
    fn test_effect_failure_is_catchable() {
        let fail = from_fn(|_| Err("upstream unavailable".to_string()));
        let (mut d, audit) = dispatcher(
            vec![(CapabilitySpec::registered("fetch"), fail)],
            ScopeBundle::unlimited(),
        );
        let fault = d.invoke("fetch", CallArgs::default()).unwrap_err();
        assert_eq!(fault, CapabilityFault::Failed("upstream unavailable".into()));
        assert_eq!(
            audit.events()[0].data["error"],
            json!("CapabilityError: upstream unavailable")
        );
    }

    #[test]
    fn test_token_exhaustion_after_budget_checks() {
        let spec = CapabilitySpec::registered("echo").with_tokens(3, 0.0);
        let scopes = ScopeBundle::new(
            TokenLedger::limited(4),
            TokenLedger::limited(0),
            TokenLedger::limited(0),
        );
        let (mut d, _) = dispatcher(vec![(spec, echo())], scopes.clone());
        d.invoke("echo", CallArgs::default()).unwrap();
        match abort(d.invoke("echo", CallArgs::default()).unwrap_err()) {
            SandboxError::TokenExhausted { needed, available, .. } => {
                assert_eq!(needed, 3);
                assert_eq!(available, 1);
            }
            other => panic!("expected TokenExhausted, got {other:?}"),
        }
        assert_eq!(scopes.snapshot().exec, Some(1));
    }

    #[test]
    fn test_max_tokens_seeds_exec_scope() {
        let spec = CapabilitySpec::registered("echo")
            .with_tokens(2, 0.0)
            .with_budget(BudgetSpec::unlimited().with_max_tokens(3));
        let scopes = ScopeBundle::new(
            TokenLedger::unlimited(),
            TokenLedger::limited(0),
            TokenLedger::limited(0),
        );
        let (mut d, _) = dispatcher(vec![(spec, echo())], scopes.clone());
        d.invoke("echo", CallArgs::default()).unwrap();
        assert_eq!(scopes.snapshot().exec, Some(1));
        assert!(d.invoke("echo", CallArgs::default()).is_err());
    }

    #[test]
    fn test_init_and_close_run_once() {
        struct Counted {
            opened: Arc<AtomicUsize>,
            closed: Arc<AtomicUsize>,
        }
        impl Capability for Counted {
            fn init(&self) -> std::result::Result<CapState, String> {
                self.opened.fetch_add(1, Ordering::SeqCst);
                Ok(CapState::new(0u64))
            }
            fn call(
                &self,
                state: &mut CapState,
                _call: &CallArgs,
            ) -> std::result::Result<serde_json::Value, String> {
                let n = state.get_mut::<u64>().ok_or("missing state")?;
                *n += 1;
                Ok(json!(*n))
            }
            fn close(&self, _state: CapState) {
                self.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
        let opened = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let cap = Arc::new(Counted {
            opened: opened.clone(),
            closed: closed.clone(),
        });
        {
            let (mut d, _) = dispatcher(
                vec![(CapabilitySpec::registered("counter"), cap)],
                ScopeBundle::unlimited(),
            );
            assert_eq!(d.invoke("counter", CallArgs::default()).unwrap(), json!(1));
            assert_eq!(d.invoke("counter", CallArgs::default()).unwrap(), json!(2));
            d.close();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
