//! Resilient fetch orchestrator.
//!
//! Per request the decision order is fixed, stopping at the first success:
//! 1. fresh cache entry: `HIT`
//! 2. primary provider, then each secondary in declared order, every call wrapped as
//!    `breaker.execute(retry.run(call, policy))`; success writes the cache and returns `MISS`
//! 3. cache entry younger than the data class's staleness ceiling: `STALE`
//! 4. [`FetchError::Unavailable`] carrying the original request parameters
//!
//! Every step is reported to the [`CallLog`]. A failed cache write is logged and does not fail
//! the read that just succeeded; a failed cache read does fail the request.
//!
//! Concurrent fetches of the same fingerprint are not coalesced: each caller runs its own
//! pipeline and may hit the providers.

use crate::backoff::BackoffPolicy;
use crate::cache::DataClass;
use crate::call_log::{
    record_best_effort, CallLog, CallRecord, NullCallLog, CACHE_PROVIDER, CIRCUIT_OPEN,
    SERVICE_ERROR, STALE_CACHE_PROVIDER,
};
use crate::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitProfile};
use crate::circuit_breaker_registry::BreakerRegistry;
use crate::clock::{to_chrono, Clock, SystemClock};
use crate::config::ConfigError;
use crate::error::{AttemptFailure, FetchError, ProviderError, ResilienceError};
use crate::retry::RetryExecutor;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{CacheEntry, CacheStore, HealthStore, ProviderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A data source the orchestrator can fall back across.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    /// Unique name; also the breaker key and the call-log provider label.
    fn name(&self) -> &str;

    /// Endpoint label written to the call log.
    fn endpoint(&self) -> String {
        "/".to_string()
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Value, ProviderError>;
}

/// One logical request: a cache fingerprint plus the parameters providers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub fingerprint: String,
    pub params: BTreeMap<String, String>,
}

impl FetchRequest {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self { fingerprint: fingerprint.into(), params: BTreeMap::new() }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// How the result was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    /// Fresh cache entry; no provider was called.
    Hit,
    /// Fetched from a provider just now.
    Miss,
    /// Expired cache entry served because every provider failed.
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Stale => "STALE",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A successful fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fetched {
    pub payload: Value,
    pub status: CacheStatus,
    /// Provider that produced the payload (for cache results, the one that originally did).
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    /// Age of the payload when returned; zero for `MISS`.
    pub age_secs: u64,
}

impl Fetched {
    pub fn is_stale(&self) -> bool {
        self.status == CacheStatus::Stale
    }
}

/// Transforms a provider payload before it is cached; an error counts as that provider failing.
pub type Normalizer = Arc<dyn Fn(&FetchRequest, Value) -> Result<Value, ProviderError> + Send + Sync>;

struct ProviderSlot {
    provider: Arc<dyn Provider>,
    breaker: CircuitBreaker,
    policy: BackoffPolicy,
}

impl fmt::Debug for ProviderSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSlot")
            .field("provider", &self.provider.name())
            .field("profile", self.breaker.profile())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Aggregated breaker view of one orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetcherHealth {
    pub class: String,
    /// HEALTHY when every provider is, DOWN when none is, DEGRADED otherwise.
    pub status: ProviderStatus,
    pub providers: Vec<BreakerStats>,
}

/// Cache-first, provider-fallback, stale-last fetch pipeline for one data class.
pub struct ResilientFetcher {
    class: DataClass,
    providers: Vec<ProviderSlot>,
    cache: Arc<dyn CacheStore>,
    call_log: Arc<dyn CallLog>,
    retry: RetryExecutor,
    clock: Arc<dyn Clock>,
    normalizer: Option<Normalizer>,
}

impl fmt::Debug for ResilientFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientFetcher")
            .field("class", &self.class)
            .field("providers", &self.providers)
            .field("normalizer", &self.normalizer.as_ref().map(|_| "<normalizer>"))
            .finish()
    }
}

impl ResilientFetcher {
    pub fn builder(
        class: DataClass,
        cache: Arc<dyn CacheStore>,
        health: Arc<dyn HealthStore>,
    ) -> ResilientFetcherBuilder {
        ResilientFetcherBuilder {
            class,
            cache,
            health,
            providers: Vec::new(),
            call_log: Arc::new(NullCallLog),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            normalizer: None,
            registry: None,
        }
    }

    pub fn class(&self) -> &DataClass {
        &self.class
    }

    /// Provider names in priority order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|slot| slot.provider.name()).collect()
    }

    /// Breaker of the named provider.
    pub fn breaker(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.providers
            .iter()
            .find(|slot| slot.provider.name() == provider)
            .map(|slot| &slot.breaker)
    }

    async fn log(&self, provider: &str, endpoint: String, status: Option<u16>, error_type: Option<String>, started: Instant) {
        let record = CallRecord {
            provider: provider.to_string(),
            endpoint,
            method: "GET".to_string(),
            status_code: status,
            error_type,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            occurred_at: self.clock.now(),
        };
        record_best_effort(self.call_log.as_ref(), record).await;
    }

    /// Run the decision pipeline for `request`.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<Fetched, FetchError> {
        let started = Instant::now();
        let now = self.clock.now();
        let cached = self.cache.get_entry(&self.class.name, &request.fingerprint).await?;
        if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh(now)) {
            tracing::debug!(
                target: "bulwark::fetch",
                class = %self.class.name,
                fingerprint = %request.fingerprint,
                "cache hit"
            );
            self.log(CACHE_PROVIDER, request.fingerprint.clone(), Some(200), None, started).await;
            return Ok(Fetched {
                payload: entry.payload.clone(),
                status: CacheStatus::Hit,
                source: entry.source.clone(),
                fetched_at: entry.fetched_at,
                age_secs: entry.age(now).as_secs(),
            });
        }

        let mut attempts = Vec::with_capacity(self.providers.len());
        for slot in &self.providers {
            let name = slot.provider.name();
            let call_started = Instant::now();
            let result = slot
                .breaker
                .execute(|| self.retry.run(|| self.call(slot, request), &slot.policy))
                .await;
            match result {
                Ok(payload) => {
                    self.log(name, slot.provider.endpoint(), Some(200), None, call_started).await;
                    let fetched_at = self.clock.now();
                    self.write_back(request, &payload, name, fetched_at).await;
                    return Ok(Fetched {
                        payload,
                        status: CacheStatus::Miss,
                        source: name.to_string(),
                        fetched_at,
                        age_secs: 0,
                    });
                }
                Err(err) => {
                    let (status, error_type, reason) = describe(&err);
                    tracing::warn!(
                        target: "bulwark::fetch",
                        class = %self.class.name,
                        fingerprint = %request.fingerprint,
                        provider = name,
                        error = %reason,
                        "provider failed, falling back"
                    );
                    self.log(name, slot.provider.endpoint(), status, Some(error_type), call_started).await;
                    attempts.push(AttemptFailure { provider: name.to_string(), reason });
                }
            }
        }

        let now = self.clock.now();
        let latest = self.cache.get_entry(&self.class.name, &request.fingerprint).await?;
        if let Some(entry) = latest.filter(|e| e.is_within(now, self.class.stale_ceiling())) {
            let age = entry.age(now);
            tracing::warn!(
                target: "bulwark::fetch",
                class = %self.class.name,
                fingerprint = %request.fingerprint,
                age_secs = age.as_secs(),
                source = %entry.source,
                "all providers failed, serving stale cache"
            );
            self.log(STALE_CACHE_PROVIDER, request.fingerprint.clone(), Some(200), None, started).await;
            return Ok(Fetched {
                payload: entry.payload,
                status: CacheStatus::Stale,
                source: entry.source,
                fetched_at: entry.fetched_at,
                age_secs: age.as_secs(),
            });
        }

        tracing::error!(
            target: "bulwark::fetch",
            class = %self.class.name,
            fingerprint = %request.fingerprint,
            attempts = attempts.len(),
            "all providers failed and no cached data is available"
        );
        self.log(
            &self.class.service_label(),
            request.fingerprint.clone(),
            Some(500),
            Some(SERVICE_ERROR.to_string()),
            started,
        )
        .await;
        Err(FetchError::Unavailable {
            class: self.class.name.clone(),
            fingerprint: request.fingerprint.clone(),
            params: request.params.clone(),
            attempts,
        })
    }

    async fn call(&self, slot: &ProviderSlot, request: &FetchRequest) -> Result<Value, ProviderError> {
        let payload = slot.provider.fetch(request).await?;
        match &self.normalizer {
            Some(normalize) => normalize(request, payload),
            None => Ok(payload),
        }
    }

    async fn write_back(&self, request: &FetchRequest, payload: &Value, source: &str, fetched_at: DateTime<Utc>) {
        let entry = CacheEntry {
            class: self.class.name.clone(),
            fingerprint: request.fingerprint.clone(),
            payload: payload.clone(),
            source: source.to_string(),
            fetched_at,
            ttl_secs: self.class.ttl_secs,
        };
        if let Err(err) = self.cache.put_entry(entry).await {
            tracing::warn!(
                target: "bulwark::fetch",
                class = %self.class.name,
                fingerprint = %request.fingerprint,
                error = %err,
                "failed to write cache entry"
            );
        }
    }

    /// Breaker stats for every provider plus an overall verdict.
    pub async fn health(&self) -> Result<FetcherHealth, crate::error::StoreError> {
        let mut providers = Vec::with_capacity(self.providers.len());
        for slot in &self.providers {
            providers.push(slot.breaker.stats().await?);
        }
        let healthy = providers.iter().filter(|s| s.is_healthy).count();
        let status = if healthy == providers.len() && healthy > 0 {
            ProviderStatus::Healthy
        } else if healthy == 0 {
            ProviderStatus::Down
        } else {
            ProviderStatus::Degraded
        };
        Ok(FetcherHealth { class: self.class.name.clone(), status, providers })
    }

    /// Delete entries past the staleness ceiling; they can never be served again.
    pub async fn purge_expired(&self) -> Result<usize, crate::error::StoreError> {
        let cutoff = self.clock.now() - to_chrono(self.class.stale_ceiling());
        self.cache.purge_entries_before(&self.class.name, cutoff).await
    }
}

fn describe(err: &ResilienceError<ProviderError>) -> (Option<u16>, String, String) {
    match err {
        ResilienceError::CircuitOpen { .. } => (None, CIRCUIT_OPEN.to_string(), err.to_string()),
        ResilienceError::Store(store) => (None, "STORE_ERROR".to_string(), store.to_string()),
        ResilienceError::Inner(inner) => (inner.status_code(), inner.error_type(), inner.to_string()),
    }
}

/// Builder for [`ResilientFetcher`]. Providers are tried in the order they are added.
pub struct ResilientFetcherBuilder {
    class: DataClass,
    cache: Arc<dyn CacheStore>,
    health: Arc<dyn HealthStore>,
    providers: Vec<(Arc<dyn Provider>, CircuitProfile, BackoffPolicy)>,
    call_log: Arc<dyn CallLog>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    normalizer: Option<Normalizer>,
    registry: Option<BreakerRegistry>,
}

impl ResilientFetcherBuilder {
    /// Append a provider; the first one added is the primary.
    pub fn provider(
        mut self,
        provider: Arc<dyn Provider>,
        profile: CircuitProfile,
        policy: BackoffPolicy,
    ) -> Self {
        self.providers.push((provider, profile, policy));
        self
    }

    pub fn call_log(mut self, call_log: Arc<dyn CallLog>) -> Self {
        self.call_log = call_log;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Take breakers from `registry`, so fetchers sharing it share each provider's half-open
    /// probe bound. Without one, breakers are private to this fetcher.
    pub fn registry(mut self, registry: BreakerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn registry_or(mut self, fallback: &BreakerRegistry) -> Self {
        if self.registry.is_none() {
            self.registry = Some(fallback.clone());
        }
        self
    }

    pub(crate) fn configured_registry(&self) -> Option<&BreakerRegistry> {
        self.registry.as_ref()
    }

    pub fn normalizer<F>(mut self, normalize: F) -> Self
    where
        F: Fn(&FetchRequest, Value) -> Result<Value, ProviderError> + Send + Sync + 'static,
    {
        self.normalizer = Some(Arc::new(normalize));
        self
    }

    pub fn build(self) -> Result<ResilientFetcher, ConfigError> {
        if self.providers.is_empty() {
            return Err(ConfigError::NoProviders { class: self.class.name });
        }
        let mut seen = std::collections::HashSet::new();
        for (provider, _, _) in &self.providers {
            if !seen.insert(provider.name().to_string()) {
                return Err(ConfigError::DuplicateProvider(provider.name().to_string()));
            }
        }
        let registry = self.registry.unwrap_or_default();
        let providers = self
            .providers
            .into_iter()
            .map(|(provider, profile, policy)| ProviderSlot {
                breaker: registry.breaker(
                    provider.name(),
                    profile,
                    self.health.clone(),
                    self.clock.clone(),
                ),
                provider,
                policy,
            })
            .collect();
        Ok(ResilientFetcher {
            class: self.class,
            providers,
            cache: self.cache,
            call_log: self.call_log,
            retry: RetryExecutor::from_shared(self.sleeper),
            clock: self.clock,
            normalizer: self.normalizer,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;
    use crate::call_log::MemoryCallLog;
    use crate::clock::ManualClock;
    use crate::error::NetworkErrorKind;
    use crate::sleeper::InstantSleeper;
    use crate::store::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store: MemoryStore,
        clock: ManualClock,
        log: MemoryCallLog,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::default();
            Self { store: MemoryStore::new(), log: MemoryCallLog::new().with_clock(clock.clone()), clock }
        }

        fn fetcher(&self, providers: &[Arc<ScriptedProvider>]) -> ResilientFetcher {
            let mut builder = ResilientFetcher::builder(
                DataClass::fx_rates(),
                Arc::new(self.store.clone()),
                Arc::new(self.store.clone()),
            )
            .call_log(Arc::new(self.log.clone()))
            .sleeper(Arc::new(InstantSleeper))
            .clock(Arc::new(self.clock.clone()));
            for provider in providers {
                builder = builder.provider(
                    provider.clone(),
                    CircuitProfile::STANDARD,
                    BackoffPolicy::default_policy(),
                );
            }
            builder.build().unwrap()
        }

        async fn seed(&self, payload: Value, age: Duration) {
            let entry = CacheEntry {
                class: "fx_rates".into(),
                fingerprint: "USD".into(),
                payload,
                source: "fx_primary".into(),
                fetched_at: self.clock.now() - to_chrono(age),
                ttl_secs: DataClass::fx_rates().ttl_secs,
            };
            self.store.put_entry(entry).await.unwrap();
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::new("USD").param("base", "USD")
    }

    #[tokio::test]
    async fn fresh_cache_skips_providers() {
        let fx = Fixture::new();
        fx.seed(json!({"KRW": 1300.0}), Duration::from_secs(60)).await;
        let primary = ScriptedProvider::new("fx_primary", vec![Ok(json!({"KRW": 1.0}))]);
        let fetcher = fx.fetcher(&[primary.clone()]);

        let fetched = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(fetched.status, CacheStatus::Hit);
        assert_eq!(fetched.payload, json!({"KRW": 1300.0}));
        assert_eq!(fetched.age_secs, 60);
        assert_eq!(primary.calls(), 0);
        assert_eq!(fx.log.records_for(CACHE_PROVIDER).len(), 1);
    }

    #[tokio::test]
    async fn primary_success_writes_cache() {
        let fx = Fixture::new();
        let primary = ScriptedProvider::new("fx_primary", vec![Ok(json!({"KRW": 1310.0}))]);
        let fetcher = fx.fetcher(&[primary.clone()]);

        let fetched = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(fetched.status, CacheStatus::Miss);
        assert_eq!(fetched.source, "fx_primary");
        let entry = fx.store.get_entry("fx_rates", "USD").await.unwrap().unwrap();
        assert_eq!(entry.source, "fx_primary");
        assert_eq!(entry.ttl_secs, 86_400);

        let again = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(again.status, CacheStatus::Hit);
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn falls_back_to_secondary() {
        let fx = Fixture::new();
        let primary = ScriptedProvider::new("fx_primary", vec![Err(ProviderError::status(503))]);
        let secondary = ScriptedProvider::new("fx_fallback", vec![Ok(json!({"KRW": 1299.0}))]);
        let fetcher = fx.fetcher(&[primary.clone(), secondary.clone()]);

        let fetched = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(fetched.status, CacheStatus::Miss);
        assert_eq!(fetched.source, "fx_fallback");
        assert_eq!(primary.calls(), 4);
        assert_eq!(secondary.calls(), 1);
        let entry = fx.store.get_entry("fx_rates", "USD").await.unwrap().unwrap();
        assert_eq!(entry.source, "fx_fallback");

        let failures = fx.log.records_for("fx_primary");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_type.as_deref(), Some("HTTP_503"));
    }

    #[tokio::test]
    async fn stale_cache_when_all_providers_fail() {
        let fx = Fixture::new();
        fx.seed(json!({"KRW": 1250.0}), Duration::from_secs(2 * 24 * 3600)).await;
        let primary = ScriptedProvider::new(
            "fx_primary",
            vec![Err(ProviderError::network(NetworkErrorKind::ConnectionRefused, "down"))],
        );
        let secondary = ScriptedProvider::new("fx_fallback", vec![Err(ProviderError::status(401))]);
        let fetcher = fx.fetcher(&[primary, secondary.clone()]);

        let fetched = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(fetched.status, CacheStatus::Stale);
        assert!(fetched.is_stale());
        assert_eq!(fetched.payload, json!({"KRW": 1250.0}));
        assert_eq!(secondary.calls(), 1);
        assert_eq!(fx.log.records_for(STALE_CACHE_PROVIDER).len(), 1);
    }

    #[tokio::test]
    async fn entries_past_the_ceiling_are_not_served() {
        let fx = Fixture::new();
        fx.seed(json!({"KRW": 1250.0}), Duration::from_secs(8 * 24 * 3600)).await;
        let primary = ScriptedProvider::new("fx_primary", vec![Err(ProviderError::status(404))]);
        let fetcher = fx.fetcher(&[primary]);

        let err = fetcher.fetch(&request()).await.unwrap_err();
        match err {
            FetchError::Unavailable { class, params, attempts, .. } => {
                assert_eq!(class, "fx_rates");
                assert_eq!(params.get("base").map(String::as_str), Some("USD"));
                assert_eq!(attempts.len(), 1);
                assert_eq!(attempts[0].provider, "fx_primary");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let terminal = fx.log.records_for("fx_rates_service");
        assert_eq!(terminal[0].error_type.as_deref(), Some(SERVICE_ERROR));
    }

    #[tokio::test]
    async fn open_circuit_is_skipped_without_calling() {
        let fx = Fixture::new();
        let primary = ScriptedProvider::new("fx_primary", vec![Err(ProviderError::status(400))]);
        let secondary = ScriptedProvider::new("fx_fallback", vec![Ok(json!({"KRW": 1.0}))]);
        let fetcher = fx.fetcher(&[primary.clone(), secondary]);

        for _ in 0..5 {
            fetcher.breaker("fx_primary").unwrap().on_failure("boom").await.unwrap();
        }
        let fetched = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(fetched.source, "fx_fallback");
        assert_eq!(primary.calls(), 0);
        let records = fx.log.records_for("fx_primary");
        assert_eq!(records[0].error_type.as_deref(), Some(CIRCUIT_OPEN));
    }

    #[tokio::test]
    async fn normalizer_failure_counts_as_provider_failure() {
        let fx = Fixture::new();
        let primary = ScriptedProvider::new("fx_primary", vec![Ok(json!("garbage"))]);
        let secondary = ScriptedProvider::new("fx_fallback", vec![Ok(json!({"KRW": 1.0}))]);
        let fetcher = ResilientFetcher::builder(
            DataClass::fx_rates(),
            Arc::new(fx.store.clone()),
            Arc::new(fx.store.clone()),
        )
        .sleeper(Arc::new(InstantSleeper))
        .clock(Arc::new(fx.clock.clone()))
        .provider(primary.clone(), CircuitProfile::STANDARD, BackoffPolicy::default_policy())
        .provider(secondary, CircuitProfile::FAST, BackoffPolicy::default_policy())
        .normalizer(|_, value| {
            if value.is_object() {
                Ok(value)
            } else {
                Err(ProviderError::Decode("expected object".into()))
            }
        })
        .build()
        .unwrap();

        let fetched = fetcher.fetch(&request()).await.unwrap();
        assert_eq!(fetched.source, "fx_fallback");
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn health_aggregates_breakers() {
        let fx = Fixture::new();
        let primary = ScriptedProvider::new("fx_primary", vec![Ok(json!({}))]);
        let secondary = ScriptedProvider::new("fx_fallback", vec![Ok(json!({}))]);
        let fetcher = fx.fetcher(&[primary, secondary]);
        assert_eq!(fetcher.health().await.unwrap().status, ProviderStatus::Healthy);

        fetcher.breaker("fx_primary").unwrap().on_failure("x").await.unwrap();
        let health = fetcher.health().await.unwrap();
        assert_eq!(health.status, ProviderStatus::Degraded);
        assert_eq!(health.providers.len(), 2);
    }

    #[test]
    fn builder_rejects_bad_provider_lists() {
        let store = MemoryStore::new();
        let empty = ResilientFetcher::builder(
            DataClass::fx_rates(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        )
        .build();
        assert!(matches!(empty, Err(ConfigError::NoProviders { .. })));

        let p = ScriptedProvider::new("fx_primary", vec![]);
        let dup = ResilientFetcher::builder(DataClass::fx_rates(), Arc::new(store.clone()), Arc::new(store))
            .provider(p.clone(), CircuitProfile::FAST, BackoffPolicy::no_retry())
            .provider(p, CircuitProfile::FAST, BackoffPolicy::no_retry())
            .build();
        assert!(matches!(dup, Err(ConfigError::DuplicateProvider(_))));
    }

    #[tokio::test]
    async fn purge_expired_respects_ceiling() {
        let fx = Fixture::new();
        fx.seed(json!({}), Duration::from_secs(8 * 24 * 3600)).await;
        let fetcher = fx.fetcher(&[ScriptedProvider::new("fx_primary", vec![])]);
        assert_eq!(fetcher.purge_expired().await.unwrap(), 1);
        assert_eq!(fx.store.cache_len(), 0);
    }
}
