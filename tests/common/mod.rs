#![allow(dead_code)]

use async_trait::async_trait;
use bulwark::{
    BackoffPolicy, CircuitProfile, DataClass, FetchRequest, InstantSleeper, Jitter, ManualClock,
    MemoryStore, Provider, ProviderError, ResilientFetcher, ResilientFetcherBuilder,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Provider that always answers with the same result and counts its calls.
#[derive(Debug)]
pub struct FixedProvider {
    name: String,
    result: Mutex<Result<Value, ProviderError>>,
    calls: AtomicUsize,
}

impl FixedProvider {
    pub fn ok(name: &str, payload: Value) -> Arc<Self> {
        Self::new(name, Ok(payload))
    }

    pub fn failing(name: &str, err: ProviderError) -> Arc<Self> {
        Self::new(name, Err(err))
    }

    fn new(name: &str, result: Result<Value, ProviderError>) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), result: Mutex::new(result), calls: AtomicUsize::new(0) })
    }

    pub fn set(&self, result: Result<Value, ProviderError>) {
        *self.result.lock().unwrap() = result;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for FixedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.lock().unwrap().clone()
    }
}

pub fn quick_policy() -> BackoffPolicy {
    BackoffPolicy::default_policy().with_jitter(Jitter::None)
}

/// FX fetcher over `store` with deterministic time and no real sleeping.
pub fn fx_builder(store: &MemoryStore, clock: &ManualClock) -> ResilientFetcherBuilder {
    ResilientFetcher::builder(DataClass::fx_rates(), Arc::new(store.clone()), Arc::new(store.clone()))
        .sleeper(Arc::new(InstantSleeper))
        .clock(Arc::new(clock.clone()))
}

pub fn two_provider_fetcher(
    store: &MemoryStore,
    clock: &ManualClock,
    primary: Arc<FixedProvider>,
    secondary: Arc<FixedProvider>,
) -> ResilientFetcher {
    fx_builder(store, clock)
        .provider(primary, CircuitProfile::CRITICAL, quick_policy())
        .provider(secondary, CircuitProfile::FAST, quick_policy())
        .build()
        .unwrap()
}
