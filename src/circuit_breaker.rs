//! Per-provider circuit breaker with externally persisted state.
//!
//! The breaker keeps no authoritative state in memory. Its state is derived from the
//! provider's [`ProviderHealth`] row:
//! - **Open**: `circuit_open_until` is set and in the future. Calls are rejected.
//! - **HalfOpen**: the open timer has elapsed. The next admission check clears it and marks the
//!   provider DEGRADED; from then until the next success or failure the provider is probing and
//!   at most `half_open_max_calls` concurrent callers in this process are admitted.
//! - **Closed**: everything else.
//!
//! A failed probe re-opens the circuit straight away because the error count is still at or
//! above the threshold; a successful one resets the row to HEALTHY.

use crate::clock::{to_chrono, Clock, SystemClock};
use crate::error::{ResilienceError, StoreError};
use crate::store::{HealthStore, ProviderHealth, ProviderStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Derived state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open timer elapses.
    Open,
    /// Probe mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

/// Validated breaker tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitProfile {
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_max_calls: usize,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    /// Failure threshold must be > 0.
    InvalidFailureThreshold {
        /// Value provided by caller.
        provided: u32,
    },
    /// Open timeout must be > 0.
    InvalidOpenTimeout(Duration),
    /// Half-open probe limit must be > 0.
    InvalidHalfOpenLimit {
        /// Value provided by caller.
        provided: usize,
    },
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold { provided } => {
                write!(f, "failure_threshold must be > 0 (got {})", provided)
            }
            CircuitBreakerError::InvalidOpenTimeout(timeout) => {
                write!(f, "open_timeout must be > 0 (got {:?})", timeout)
            }
            CircuitBreakerError::InvalidHalfOpenLimit { provided } => {
                write!(f, "half_open_max_calls must be > 0 (got {})", provided)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl CircuitProfile {
    /// Core-revenue providers: slow to open, slow to recover.
    pub const CRITICAL: CircuitProfile = CircuitProfile {
        failure_threshold: 8,
        open_timeout: Duration::from_secs(120),
        half_open_max_calls: 2,
    };

    pub const STANDARD: CircuitProfile = CircuitProfile {
        failure_threshold: 5,
        open_timeout: Duration::from_secs(60),
        half_open_max_calls: 3,
    };

    /// Best-effort and secondary providers: quick to open, quick to recover.
    pub const FAST: CircuitProfile = CircuitProfile {
        failure_threshold: 3,
        open_timeout: Duration::from_secs(30),
        half_open_max_calls: 5,
    };

    /// Create a profile with validation.
    pub fn new(
        failure_threshold: u32,
        open_timeout: Duration,
        half_open_max_calls: usize,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if open_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidOpenTimeout(open_timeout));
        }
        if half_open_max_calls == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: 0 });
        }
        Ok(Self { failure_threshold, open_timeout, half_open_max_calls })
    }

    /// Failures before opening.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// How long the circuit stays open before probing.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Maximum concurrent probes while half-open.
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }
}

impl Default for CircuitProfile {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Named profile, as selected in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileName {
    Critical,
    #[default]
    Standard,
    Fast,
}

impl ProfileName {
    pub fn profile(self) -> CircuitProfile {
        match self {
            ProfileName::Critical => CircuitProfile::CRITICAL,
            ProfileName::Standard => CircuitProfile::STANDARD,
            ProfileName::Fast => CircuitProfile::FAST,
        }
    }
}

/// Snapshot of a provider's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub status: ProviderStatus,
    pub state: CircuitState,
    pub error_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub is_healthy: bool,
}

/// Circuit breaker for one named provider.
///
/// Clones share the same probe counter, so all handles in a process observe the same half-open
/// limit. Failure accounting lives in the [`HealthStore`] and is shared across processes.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    profile: CircuitProfile,
    store: Arc<dyn HealthStore>,
    clock: Arc<dyn Clock>,
    probes: Arc<AtomicUsize>,
}

struct ProbeGuard {
    probes: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.probes.fetch_sub(1, Ordering::Release);
    }
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        profile: CircuitProfile,
        store: Arc<dyn HealthStore>,
    ) -> Self {
        Self {
            name: name.into(),
            profile,
            store,
            clock: Arc::new(SystemClock),
            probes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share `other`'s half-open probe counter.
    pub(crate) fn sharing_probes_with(mut self, other: &CircuitBreaker) -> Self {
        self.probes = other.probes.clone();
        self
    }

    #[cfg(test)]
    pub(crate) fn shares_probes_with(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.probes, &other.probes)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> &CircuitProfile {
        &self.profile
    }

    fn probing(&self, health: &ProviderHealth) -> bool {
        health.circuit_open_until.is_none()
            && health.status == ProviderStatus::Degraded
            && health.error_count >= self.profile.failure_threshold
    }

    fn derive_state(&self, health: &ProviderHealth, now: DateTime<Utc>) -> CircuitState {
        match health.circuit_open_until {
            Some(until) if until > now => CircuitState::Open,
            Some(_) => CircuitState::HalfOpen,
            None if self.probing(health) => CircuitState::HalfOpen,
            None => CircuitState::Closed,
        }
    }

    /// Whether a call may proceed. Lazily creates the provider row and performs the
    /// OPEN to HALF_OPEN transition once the open timer has elapsed.
    pub async fn can_call(&self) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let admission = self.store.admit(&self.name, now).await?;
        if admission.half_opened {
            tracing::info!(target: "bulwark::circuit_breaker", provider = %self.name, "circuit half-open, probing");
        }
        Ok(!admission.health.is_open_at(now))
    }

    /// Record a successful call.
    pub async fn on_success(&self) -> Result<(), StoreError> {
        let recorded = self.store.record_success(&self.name, self.clock.now()).await?;
        if recorded.previous.is_some_and(|status| status != ProviderStatus::Healthy) {
            tracing::info!(target: "bulwark::circuit_breaker", provider = %self.name, "circuit closed");
        }
        Ok(())
    }

    /// Record a failed call; opens the circuit once the threshold is reached.
    pub async fn on_failure(&self, reason: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let open_until = now + to_chrono(self.profile.open_timeout);
        let health = self
            .store
            .record_failure(&self.name, now, self.profile.failure_threshold, open_until)
            .await?;
        if health.circuit_open_until.is_some() {
            tracing::warn!(
                target: "bulwark::circuit_breaker",
                provider = %self.name,
                failures = health.error_count,
                open_until = %open_until,
                error = %reason,
                "circuit opened"
            );
        } else {
            tracing::debug!(
                target: "bulwark::circuit_breaker",
                provider = %self.name,
                failures = health.error_count,
                error = %reason,
                "provider failure recorded"
            );
        }
        Ok(())
    }

    fn acquire_probe(&self) -> Option<ProbeGuard> {
        let current = self.probes.fetch_add(1, Ordering::AcqRel);
        if current >= self.profile.half_open_max_calls {
            self.probes.fetch_sub(1, Ordering::Release);
            return None;
        }
        tracing::debug!(
            target: "bulwark::circuit_breaker",
            provider = %self.name,
            in_flight = current + 1,
            max = self.profile.half_open_max_calls,
            "half-open probe admitted"
        );
        Some(ProbeGuard { probes: self.probes.clone() })
    }

    /// Executes the operation under circuit breaker protection.
    ///
    /// # Errors
    /// - `CircuitOpen` if the circuit is open or the half-open probe limit is reached; the
    ///   operation is not invoked.
    /// - `Store` if admission could not be decided.
    /// - `Inner(E)` with the operation's own error, unchanged.
    ///
    /// Store failures while recording the outcome are logged and do not replace the result.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        E: std::fmt::Display,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let now = self.clock.now();
        let admission = self.store.admit(&self.name, now).await.map_err(ResilienceError::Store)?;
        if admission.half_opened {
            tracing::info!(target: "bulwark::circuit_breaker", provider = %self.name, "circuit half-open, probing");
        }
        if admission.health.is_open_at(now) {
            return Err(ResilienceError::CircuitOpen {
                provider: self.name.clone(),
                open_until: admission.health.circuit_open_until,
            });
        }

        let probe = if self.probing(&admission.health) {
            match self.acquire_probe() {
                Some(guard) => Some(guard),
                None => {
                    return Err(ResilienceError::CircuitOpen {
                        provider: self.name.clone(),
                        open_until: None,
                    })
                }
            }
        } else {
            None
        };

        let result = operation().await;

        // The probe slot stays held until the outcome is recorded.
        let failure = result.as_ref().err().map(|err| err.to_string());
        let accounting = match failure {
            None => self.on_success().await,
            Some(reason) => self.on_failure(&reason).await,
        };
        if let Err(store_err) = accounting {
            tracing::warn!(
                target: "bulwark::circuit_breaker",
                provider = %self.name,
                error = %store_err,
                "failed to record call outcome"
            );
        }
        drop(probe);

        result.map_err(ResilienceError::Inner)
    }

    /// Derived state without side effects.
    pub async fn state(&self) -> Result<CircuitState, StoreError> {
        let now = self.clock.now();
        Ok(match self.store.get_health(&self.name).await? {
            Some(health) => self.derive_state(&health, now),
            None => CircuitState::Closed,
        })
    }

    pub async fn stats(&self) -> Result<BreakerStats, StoreError> {
        let now = self.clock.now();
        let health = self
            .store
            .get_health(&self.name)
            .await?
            .unwrap_or_else(|| ProviderHealth::new(self.name.clone()));
        let state = self.derive_state(&health, now);
        Ok(BreakerStats {
            is_healthy: health.status == ProviderStatus::Healthy && state == CircuitState::Closed,
            name: health.name,
            status: health.status,
            state,
            error_count: health.error_count,
            last_success_at: health.last_success_at,
            last_error_at: health.last_error_at,
            circuit_open_until: health.circuit_open_until,
        })
    }

    /// Manually restore the provider to HEALTHY.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.reset_health(&self.name).await?;
        tracing::info!(target: "bulwark::circuit_breaker", provider = %self.name, "circuit manually reset");
        Ok(())
    }
}
