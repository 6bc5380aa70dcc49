//! Registry of circuit breakers keyed by provider name.
//!
//! Failure accounting already lives in the [`HealthStore`], but the half-open probe bound is an
//! in-process counter. Fetchers that share a registry also share that counter for a provider, so
//! a provider behind several data classes admits at most `half_open_max_calls` probes in total.

use crate::circuit_breaker::{CircuitBreaker, CircuitProfile, CircuitState};
use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::HealthStore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared, cloneable map of provider name to breaker.
#[derive(Debug, Default, Clone)]
pub struct BreakerRegistry {
    inner: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CircuitBreaker>> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CircuitBreaker>> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Breaker for `name`. The first registration creates it; later ones get a breaker with
    /// their own profile, store and clock that shares the first one's probe counter.
    pub fn breaker(
        &self,
        name: &str,
        profile: CircuitProfile,
        store: Arc<dyn HealthStore>,
        clock: Arc<dyn Clock>,
    ) -> CircuitBreaker {
        let fresh = CircuitBreaker::new(name, profile, store).with_shared_clock(clock);
        let mut map = self.write();
        match map.get(name) {
            Some(existing) => {
                if existing.profile() != &profile {
                    tracing::warn!(
                        target: "bulwark::circuit_breaker_registry",
                        provider = %name,
                        "provider registered with differing circuit profiles"
                    );
                }
                fresh.sharing_probes_with(existing)
            }
            None => {
                map.insert(name.to_string(), fresh.clone());
                fresh
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<CircuitBreaker> {
        self.read().get(name).cloned()
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Reset the named provider. Returns false if it was never registered.
    pub async fn reset(&self, name: &str) -> Result<bool, StoreError> {
        match self.get(name) {
            Some(breaker) => breaker.reset().await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Derived state of every registered breaker, sorted by name.
    pub async fn snapshot(&self) -> Result<Vec<(String, CircuitState)>, StoreError> {
        let mut breakers: Vec<_> = self.read().values().cloned().collect();
        breakers.sort_by(|a, b| a.name().cmp(b.name()));
        let mut states = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            states.push((breaker.name().to_string(), breaker.state().await?));
        }
        Ok(states)
    }
}
