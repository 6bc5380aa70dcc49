//! Idempotency key store: deduplicates retried mutations by key and request content.
//!
//! The request hash is the SHA-256 (hex) of the canonical JSON of `{"body": .., "query": ..}`
//! after volatile fields (timestamps, nonces, request ids) are removed at every depth, so
//! functionally identical retries hash identically.
//!
//! Lifecycle of a key:
//! - first sight: a record with no response is created and the caller runs the mutation
//! - same key, same hash, still valid: the stored response is returned, or
//!   [`PriorResponse::InFlight`] while the original request has not completed
//! - same key, different hash: [`IdempotencyError::Conflict`]; the record is untouched
//! - expired: the record is replaced and the request proceeds as new
//!
//! Expired records are also swept opportunistically from [`IdempotencyKeyStore::begin`], at most
//! once per sweep interval, on a detached task.

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{expiry, IdempotencyRecord, IdempotencyStore};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Fields removed before hashing.
pub const DEFAULT_SKIP_FIELDS: [&str; 5] = ["timestamp", "requestId", "_t", "csrf", "nonce"];
/// Default record lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
/// Default minimum spacing between opportunistic sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The key was already used with different request content.
    #[error("idempotency key '{key}' reused with different request content")]
    Conflict { key: String, endpoint: String },
    #[error("idempotency store failure: {0}")]
    Store(#[from] StoreError),
}

impl IdempotencyError {
    /// HTTP status a route layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Conflict { .. } => 409,
            Self::Store(_) => 500,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// What a duplicate request gets back.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorResponse {
    /// The original request completed with this response.
    Completed(Value),
    /// The original request has not completed yet. Do not re-execute.
    InFlight,
}

/// Result of [`IdempotencyKeyStore::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    /// The mutation ran now.
    Executed(Value),
    /// A previous run's response was returned; the mutation did not run.
    Replayed(Value),
    /// Another request with this key is still running; the mutation did not run.
    InFlight,
}

impl Execution {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Executed(v) | Self::Replayed(v) => Some(v),
            Self::InFlight => None,
        }
    }
}

/// Error from [`IdempotencyKeyStore::execute`].
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error("mutation failed: {0}")]
    Mutation(#[source] E),
}

/// TTL and extra volatile fields for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPolicy {
    pub ttl: Duration,
    pub skip_fields: Vec<String>,
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL, skip_fields: Vec::new() }
    }
}

/// Remove `skip` keys from every object in `value`, at any depth.
pub fn strip_fields(value: &Value, skip: &BTreeSet<String>) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !skip.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), strip_fields(v, skip)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| strip_fields(v, skip)).collect()),
        other => other.clone(),
    }
}

/// JSON with object keys sorted at every level.
fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    canonical_json(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Idempotency key store over a persistent [`IdempotencyStore`].
#[derive(Debug, Clone)]
pub struct IdempotencyKeyStore {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    defaults: EndpointPolicy,
    endpoints: HashMap<String, EndpointPolicy>,
    sweep_interval: Duration,
    last_sweep_millis: Arc<AtomicI64>,
}

impl IdempotencyKeyStore {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            defaults: EndpointPolicy::default(),
            endpoints: HashMap::new(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            last_sweep_millis: Arc::new(AtomicI64::new(i64::MIN)),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Policy for endpoints without their own.
    pub fn with_defaults(mut self, defaults: EndpointPolicy) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, policy: EndpointPolicy) -> Self {
        self.endpoints.insert(endpoint.into(), policy);
        self
    }

    /// Minimum spacing between opportunistic sweeps; zero sweeps on every call.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    fn policy(&self, endpoint: &str) -> &EndpointPolicy {
        self.endpoints.get(endpoint).unwrap_or(&self.defaults)
    }

    /// Hash of the normalised body and query for `endpoint`.
    pub fn request_hash(&self, endpoint: &str, body: &Value, query: &Value) -> String {
        let skip: BTreeSet<String> = DEFAULT_SKIP_FIELDS
            .iter()
            .map(|s| s.to_string())
            .chain(self.policy(endpoint).skip_fields.iter().cloned())
            .collect();
        let empty = || Value::Object(Map::new());
        let body = if body.is_null() { empty() } else { strip_fields(body, &skip) };
        let query = if query.is_null() { empty() } else { strip_fields(query, &skip) };
        let mut input = Map::new();
        input.insert("body".to_string(), body);
        input.insert("query".to_string(), query);

        let mut canonical = String::new();
        canonical_json(&Value::Object(input), &mut canonical);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Register `key` or report what a previous request with it produced.
    ///
    /// `Ok(None)` means the caller should run the mutation and then call [`complete`] or
    /// [`abandon`].
    ///
    /// [`complete`]: IdempotencyKeyStore::complete
    /// [`abandon`]: IdempotencyKeyStore::abandon
    pub async fn begin(
        &self,
        key: &str,
        endpoint: &str,
        body: &Value,
        query: &Value,
    ) -> Result<Option<PriorResponse>, IdempotencyError> {
        self.maybe_sweep();

        let now = self.clock.now();
        let request_hash = self.request_hash(endpoint, body, query);
        let record = IdempotencyRecord {
            key: key.to_string(),
            endpoint: endpoint.to_string(),
            request_hash: request_hash.clone(),
            response_body: None,
            created_at: now,
            expires_at: expiry(now, self.policy(endpoint).ttl),
        };

        let mut existing = self.store.insert_if_absent(record.clone()).await?;
        if existing.as_ref().is_some_and(|r| r.is_expired(now)) {
            tracing::debug!(target: "bulwark::idempotency", key, "replacing expired idempotency record");
            self.store.delete_if_expired(key, now).await?;
            existing = self.store.insert_if_absent(record).await?;
        }

        match existing {
            None => Ok(None),
            Some(prior) if prior.request_hash != request_hash => {
                tracing::warn!(
                    target: "bulwark::idempotency",
                    key,
                    endpoint,
                    original_endpoint = %prior.endpoint,
                    "idempotency key reused with different request content"
                );
                Err(IdempotencyError::Conflict { key: key.to_string(), endpoint: endpoint.to_string() })
            }
            Some(prior) => {
                tracing::debug!(target: "bulwark::idempotency", key, "duplicate request");
                Ok(Some(match prior.response_body {
                    Some(body) => PriorResponse::Completed(body),
                    None => PriorResponse::InFlight,
                }))
            }
        }
    }

    /// Store the response of a successful mutation.
    pub async fn complete(&self, key: &str, response: Value) -> Result<(), IdempotencyError> {
        if !self.store.complete_record(key, response).await? {
            tracing::warn!(target: "bulwark::idempotency", key, "completed key has no record");
        }
        Ok(())
    }

    /// Delete the record after a failed mutation so a retry runs as a new request.
    pub async fn abandon(&self, key: &str) -> Result<(), IdempotencyError> {
        self.store.delete_record(key).await?;
        Ok(())
    }

    /// `begin`, run `mutation` if needed, then `complete` or `abandon`.
    ///
    /// Failing to store the response is logged and does not fail a mutation that succeeded.
    pub async fn execute<E, F, Fut>(
        &self,
        key: &str,
        endpoint: &str,
        body: &Value,
        query: &Value,
        mutation: F,
    ) -> Result<Execution, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        match self.begin(key, endpoint, body, query).await? {
            Some(PriorResponse::Completed(body)) => return Ok(Execution::Replayed(body)),
            Some(PriorResponse::InFlight) => return Ok(Execution::InFlight),
            None => {}
        }
        match mutation().await {
            Ok(value) => {
                if let Err(err) = self.complete(key, value.clone()).await {
                    tracing::error!(target: "bulwark::idempotency", key, error = %err, "failed to store idempotent response");
                }
                Ok(Execution::Executed(value))
            }
            Err(err) => {
                if let Err(cleanup) = self.abandon(key).await {
                    tracing::error!(target: "bulwark::idempotency", key, error = %cleanup, "failed to release idempotency key");
                }
                Err(ExecuteError::Mutation(err))
            }
        }
    }

    /// Delete every expired record now.
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        let removed = self.store.purge_expired(self.clock.now()).await?;
        if removed > 0 {
            tracing::debug!(target: "bulwark::idempotency", removed, "expired idempotency records swept");
        }
        Ok(removed)
    }

    fn maybe_sweep(&self) {
        let now = self.clock.now().timestamp_millis();
        let last = self.last_sweep_millis.load(Ordering::Acquire);
        let interval = i64::try_from(self.sweep_interval.as_millis()).unwrap_or(i64::MAX);
        if last != i64::MIN && now.saturating_sub(last) < interval {
            return;
        }
        if self
            .last_sweep_millis
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let at = self.clock.now();
        handle.spawn(async move {
            if let Err(err) = store.purge_expired(at).await {
                tracing::warn!(target: "bulwark::idempotency", error = %err, "idempotency sweep failed");
            }
        });
    }

    /// A fresh client key: `<prefix>-<millis>-<uuid>`.
    pub fn generate_key(&self, prefix: &str) -> String {
        format!("{}-{}-{}", prefix, self.clock.now().timestamp_millis(), uuid::Uuid::new_v4())
    }
}
