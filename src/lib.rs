#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Bulwark
//!
//! Integration resilience for services that depend on unreliable third-party APIs and that
//! must not lose the side effects of their own writes.
//!
//! ## Read path
//!
//! - **Backoff policies** with capped exponential delay and jitter ([`BackoffPolicy`])
//! - **Retry executor** that re-raises the original error when retries run out
//! - **Circuit breakers** whose state lives in a shared [`HealthStore`], so every process sees
//!   the same CLOSED / OPEN / HALF_OPEN view of a provider
//! - **Resilient fetcher**: fresh cache, then providers in priority order, then stale cache
//!   within a hard ceiling, then a typed [`FetchError::Unavailable`]
//!
//! ## Write path
//!
//! - **Idempotency keys** that replay the stored response for a retried mutation and reject
//!   key reuse with different content
//! - **Transactional outbox** delivered at least once by a polling [`OutboxDispatcher`]
//!
//! ## Quick Start
//!
//! ```rust
//! use async_trait::async_trait;
//! use bulwark::{
//!     BackoffPolicy, CacheStatus, CircuitProfile, DataClass, FetchRequest, MemoryStore,
//!     Provider, ProviderError, ResilientFetcher,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Rates;
//!
//! #[async_trait]
//! impl Provider for Rates {
//!     fn name(&self) -> &str {
//!         "fx_primary"
//!     }
//!
//!     async fn fetch(&self, _request: &FetchRequest) -> Result<Value, ProviderError> {
//!         Ok(json!({"KRW": 1300.5}))
//!     }
//! }
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = MemoryStore::new();
//! let fetcher = ResilientFetcher::builder(
//!     DataClass::fx_rates(),
//!     Arc::new(store.clone()),
//!     Arc::new(store),
//! )
//! .provider(Arc::new(Rates), CircuitProfile::CRITICAL, BackoffPolicy::default_policy())
//! .build()
//! .unwrap();
//!
//! let first = fetcher.fetch(&FetchRequest::new("USD")).await.unwrap();
//! assert_eq!(first.status, CacheStatus::Miss);
//! let second = fetcher.fetch(&FetchRequest::new("USD")).await.unwrap();
//! assert_eq!(second.status, CacheStatus::Hit);
//! # });
//! ```

pub mod backoff;
pub mod cache;
pub mod call_log;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod error;
pub mod fetch;
pub mod flights;
pub mod fx;
pub mod handlers;
pub mod http;
pub mod idempotency;
pub mod jitter;
pub mod outbox;
pub mod prelude;
pub mod retry;
pub mod sleeper;
pub mod store;

// Re-exports
pub use backoff::{BackoffError, BackoffPolicy, FailureSignal, RetryOn};
pub use cache::DataClass;
pub use call_log::{CallLog, CallRecord, MemoryCallLog, NullCallLog, TracingCallLog};
pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitProfile, CircuitState, ProfileName};
pub use circuit_breaker_registry::BreakerRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BulwarkConfig, ConfigError, RetryPreset};
pub use error::{ErrorClass, FetchError, NetworkErrorKind, ProviderError, ResilienceError, StoreError};
pub use fetch::{CacheStatus, FetchRequest, Fetched, Provider, ResilientFetcher, ResilientFetcherBuilder};
pub use flights::{FlightSearch, FlightService};
pub use fx::FxService;
pub use handlers::{Broadcaster, HandlerError, HandlerRegistry, SideEffectHandler};
pub use http::{HttpClient, HttpJsonProvider};
pub use idempotency::{Execution, IdempotencyError, IdempotencyKeyStore, PriorResponse};
pub use jitter::Jitter;
pub use outbox::{CycleReport, DispatcherConfig, OutboxDispatcher};
pub use retry::RetryExecutor;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{
    CacheStore, HealthStore, IdempotencyStore, MemoryStore, OutboxMessage, OutboxStats, OutboxStore,
    ProviderHealth, ProviderStatus, SuccessRecord,
};
