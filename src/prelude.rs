//! Convenient re-exports for common Bulwark types.
pub use crate::{
    backoff::{BackoffError, BackoffPolicy, Classify, FailureSignal, RetryOn, MAX_BACKOFF},
    cache::DataClass,
    call_log::{CallLog, CallRecord, MemoryCallLog},
    circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitProfile, CircuitState},
    circuit_breaker_registry::BreakerRegistry,
    clock::{Clock, SystemClock},
    error::{FetchError, ProviderError, ResilienceError, StoreError},
    fetch::{CacheStatus, FetchRequest, Provider, ResilientFetcher},
    handlers::{HandlerRegistry, SideEffectHandler},
    idempotency::{Execution, IdempotencyKeyStore, PriorResponse},
    jitter::Jitter,
    outbox::OutboxDispatcher,
    retry::RetryExecutor,
    store::MemoryStore,
};
