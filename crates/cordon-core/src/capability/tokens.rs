//! Token ledgers for the exec, session and tenant scopes.
//!
//! Ledgers live with the host. Session and tenant ledgers are shared by
//! every execution of an environment; the exec ledger is created per
//! execution. Workers consume through the protocol and never hold a copy.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

/// One token counter. `None` means unlimited.
#[derive(Debug, Default)]
pub struct TokenLedger {
    remaining: Mutex<Option<u64>>,
}

impl TokenLedger {
    pub fn new(tokens: Option<u64>) -> Self {
        Self {
            remaining: Mutex::new(tokens),
        }
    }

    pub fn limited(tokens: u64) -> Arc<Self> {
        Arc::new(Self::new(Some(tokens)))
    }

    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self::new(None))
    }

    fn lock(&self) -> MutexGuard<'_, Option<u64>> {
        self.remaining.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn remaining(&self) -> Option<u64> {
        *self.lock()
    }

    pub fn set(&self, tokens: Option<u64>) {
        *self.lock() = tokens;
    }
}

/// Remaining tokens per scope after an execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub exec: Option<u64>,
    pub session: Option<u64>,
    pub tenant: Option<u64>,
}

/// The three ordered scopes an execution draws from.
#[derive(Debug, Clone)]
pub struct ScopeBundle {
    pub exec: Arc<TokenLedger>,
    pub session: Arc<TokenLedger>,
    pub tenant: Arc<TokenLedger>,
}

impl ScopeBundle {
    pub fn new(exec: Arc<TokenLedger>, session: Arc<TokenLedger>, tenant: Arc<TokenLedger>) -> Self {
        Self {
            exec,
            session,
            tenant,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(
            TokenLedger::unlimited(),
            TokenLedger::unlimited(),
            TokenLedger::unlimited(),
        )
    }

    /// Give the exec scope `tokens` if it is still unset.
    pub fn init_exec(&self, tokens: u64) {
        let mut exec = self.exec.lock();
        if exec.is_none() {
            *exec = Some(tokens);
        }
    }

    /// Draw `n` tokens for `capability`, all or nothing.
    ///
    /// Set scopes are drained in order (exec, session, tenant). A remainder
    /// is absorbed when any scope is unlimited; otherwise nothing is drawn.
    pub fn consume(&self, capability: &str, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut guards = [self.exec.lock(), self.session.lock(), self.tenant.lock()];
        if guards.iter().all(|g| g.is_none()) {
            return Ok(());
        }
        let mut needed = n;
        let mut plan = [0u64; 3];
        for (take, guard) in plan.iter_mut().zip(guards.iter()) {
            if let Some(remaining) = **guard {
                *take = remaining.min(needed);
                needed -= *take;
            }
        }
        if needed > 0 && guards.iter().all(|g| g.is_some()) {
            let available = guards.iter().filter_map(|g| **g).sum();
            return Err(SandboxError::TokenExhausted {
                capability: capability.to_string(),
                needed: n,
                available,
            });
        }
        for (take, guard) in plan.iter().zip(guards.iter_mut()) {
            if let Some(remaining) = guard.as_mut() {
                *remaining -= *take;
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TokenSnapshot {
        TokenSnapshot {
            exec: self.exec.remaining(),
            session: self.session.remaining(),
            tenant: self.tenant.remaining(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draining_order_and_unlimited_absorption() {
        let bundle = ScopeBundle::new(
            TokenLedger::limited(5),
            TokenLedger::limited(10),
            TokenLedger::unlimited(),
        );
        bundle.consume("cap", 7).unwrap();
        assert_eq!(
            bundle.snapshot(),
            TokenSnapshot {
                exec: Some(0),
                session: Some(8),
                tenant: None
            }
        );
        bundle.consume("cap", 7).unwrap();
        assert_eq!(bundle.snapshot().session, Some(1));
        bundle.consume("cap", 7).unwrap();
        assert_eq!(bundle.snapshot().session, Some(0));
        assert_eq!(bundle.snapshot().exec, Some(0));
    }

    #[test]
    fn test_all_limited_is_all_or_nothing() {
        let bundle = ScopeBundle::new(
            TokenLedger::limited(2),
            TokenLedger::limited(3),
            TokenLedger::limited(1),
        );
        let err = bundle.consume("search", 7).unwrap_err();
        match err {
            SandboxError::TokenExhausted {
                needed, available, ..
            } => {
                assert_eq!(needed, 7);
                assert_eq!(available, 6);
            }
            other => panic!("expected TokenExhausted, got {other:?}"),
        }
        assert_eq!(
            bundle.snapshot(),
            TokenSnapshot {
                exec: Some(2),
                session: Some(3),
                tenant: Some(1)
            }
        );
        bundle.consume("search", 6).unwrap();
        assert_eq!(bundle.snapshot().tenant, Some(0));
    }

    #[test]
    fn test_all_unset_is_unlimited() {
        let bundle = ScopeBundle::unlimited();
        bundle.consume("cap", u64::MAX).unwrap();
        assert_eq!(bundle.snapshot(), TokenSnapshot::default());
    }

    #[test]
    fn test_init_exec_only_fills_unset_scope() {
        let bundle = ScopeBundle::unlimited();
        bundle.init_exec(4);
        bundle.init_exec(9);
        assert_eq!(bundle.snapshot().exec, Some(4));
        bundle.consume("cap", 4).unwrap();
        bundle.consume("cap", 1).unwrap();
        assert_eq!(bundle.snapshot().exec, Some(0));
    }

    #[test]
    fn test_shared_session_ledger_across_bundles() {
        let session = TokenLedger::limited(10);
        let tenant = TokenLedger::limited(0);
        let first = ScopeBundle::new(TokenLedger::limited(0), session.clone(), tenant.clone());
        let second = ScopeBundle::new(TokenLedger::limited(0), session.clone(), tenant);
        first.consume("a", 6).unwrap();
        assert!(second.consume("b", 6).is_err());
        second.consume("b", 4).unwrap();
        assert_eq!(session.remaining(), Some(0));
    }
}
