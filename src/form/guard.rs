//! Staleness tokens for asynchronous continuations.
//!
//! A [`GuardScope`] stands for one reactive trigger: a field's validation slot
//! or a composed field's schema fetch. Every time the trigger fires the scope
//! hands out a fresh [`EffectGuard`]; older guards of the same scope turn
//! stale. Tearing the scope down makes every guard stale for good.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum StaleEffect {
    #[error("effect owner was torn down")]
    TornDown,
    #[error("effect generation {generation} superseded by {current}")]
    Superseded { generation: u64, current: u64 },
}

#[derive(Debug, Default)]
struct ScopeState {
    generation: AtomicU64,
    torn_down: AtomicBool,
}

#[derive(Clone, Debug, Default)]
pub struct GuardScope {
    state: Arc<ScopeState>,
}

impl GuardScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> EffectGuard {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        EffectGuard {
            state: self.state.clone(),
            generation,
        }
    }

    pub fn teardown(&self) {
        self.state.torn_down.store(true, Ordering::SeqCst);
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.torn_down.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct EffectGuard {
    state: Arc<ScopeState>,
    generation: u64,
}

impl EffectGuard {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fails once the owning scope is torn down or a newer guard was begun.
    pub fn check_validity(&self) -> Result<(), StaleEffect> {
        if self.state.torn_down.load(Ordering::SeqCst) {
            return Err(StaleEffect::TornDown);
        }
        let current = self.state.generation.load(Ordering::SeqCst);
        if current != self.generation {
            return Err(StaleEffect::Superseded {
                generation: self.generation,
                current,
            });
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.check_validity().is_ok()
    }

    pub fn belongs_to(&self, scope: &GuardScope) -> bool {
        Arc::ptr_eq(&self.state, &scope.state)
    }
}
