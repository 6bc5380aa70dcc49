//! Persistent state behind the resilience layer.
//!
//! Nothing authoritative lives in process memory: provider health, cached payloads,
//! idempotency records and outbox messages all sit behind these traits. Every
//! read-modify-write sequence is a single trait call, so a database backend can implement it as
//! one atomic upsert or conditional update and concurrent callers stay consistent.
//!
//! [`MemoryStore`] implements all four traits for tests and single-process deployments.

mod memory;

pub use memory::MemoryStore;

use crate::clock::{elapsed_between, to_chrono};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Persisted provider status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    Healthy,
    Degraded,
    Down,
}

impl ProviderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Down => "DOWN",
        }
    }
}

/// One row per named provider; created lazily, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub name: String,
    pub status: ProviderStatus,
    pub error_count: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub circuit_open_until: Option<DateTime<Utc>>,
}

impl ProviderHealth {
    /// A fresh, healthy row.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProviderStatus::Healthy,
            error_count: 0,
            last_success_at: None,
            last_error_at: None,
            circuit_open_until: None,
        }
    }

    /// Calls are rejected while the open timer is set and still in the future.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.circuit_open_until.is_some_and(|until| until > now)
    }
}

/// Result of an admission check: the row after any lazy OPEN to HALF_OPEN transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub health: ProviderHealth,
    /// True when this call cleared an elapsed open timer.
    pub half_opened: bool,
}

/// Outcome of [`HealthStore::record_success`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessRecord {
    pub previous: Option<ProviderStatus>,
    pub health: ProviderHealth,
}

#[async_trait]
pub trait HealthStore: Send + Sync + std::fmt::Debug {
    /// Read a row without creating it.
    async fn get_health(&self, name: &str) -> Result<Option<ProviderHealth>, StoreError>;

    /// Upsert the row if missing; if its open timer has elapsed at `now`, clear it and mark the
    /// provider DEGRADED. Returns the resulting row.
    async fn admit(&self, name: &str, now: DateTime<Utc>) -> Result<Admission, StoreError>;

    /// HEALTHY, zero errors, no open timer, `last_success_at = now`. Reports the status the row
    /// had before, `None` when the row was created by this call.
    async fn record_success(&self, name: &str, now: DateTime<Utc>)
        -> Result<SuccessRecord, StoreError>;

    /// Increment the error count and stamp `last_error_at`. Once the count reaches `threshold`
    /// the row becomes DOWN with `circuit_open_until = open_until`; below it, DEGRADED.
    async fn record_failure(
        &self,
        name: &str,
        now: DateTime<Utc>,
        threshold: u32,
        open_until: DateTime<Utc>,
    ) -> Result<ProviderHealth, StoreError>;

    /// Restore HEALTHY / 0 errors / no open timer, keeping timestamps.
    async fn reset_health(&self, name: &str) -> Result<ProviderHealth, StoreError>;

    async fn list_health(&self) -> Result<Vec<ProviderHealth>, StoreError>;
}

/// Cached provider result for one fingerprint of one data class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub class: String,
    pub fingerprint: String,
    pub payload: Value,
    /// Provider that produced the payload.
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.fetched_at, now)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < Duration::from_secs(self.ttl_secs)
    }

    /// Usable as a stale fallback: younger than `ceiling`.
    pub fn is_within(&self, now: DateTime<Utc>, ceiling: Duration) -> bool {
        self.age(now) < ceiling
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync + std::fmt::Debug {
    async fn get_entry(&self, class: &str, fingerprint: &str)
        -> Result<Option<CacheEntry>, StoreError>;

    /// Upsert keyed by `(class, fingerprint)`.
    async fn put_entry(&self, entry: CacheEntry) -> Result<(), StoreError>;

    /// Delete entries of `class` fetched before `cutoff`. Returns how many were removed.
    async fn purge_entries_before(&self, class: &str, cutoff: DateTime<Utc>)
        -> Result<usize, StoreError>;
}

/// Stored outcome of an idempotent mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub endpoint: String,
    pub request_hash: String,
    /// `None` while the original request is still in flight.
    pub response_body: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync + std::fmt::Debug {
    /// Insert `record` unless its key exists. Returns the existing record when one does.
    async fn insert_if_absent(&self, record: IdempotencyRecord)
        -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Store the response. Returns false if the record no longer exists.
    async fn complete_record(&self, key: &str, response: Value) -> Result<bool, StoreError>;

    async fn delete_record(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete the record only if it has expired at `now`.
    async fn delete_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Side effect recorded alongside the mutation that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: String,
    pub topic: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl OutboxMessage {
    pub fn new(topic: impl Into<String>, payload: Value, created_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            created_at,
            delivered_at: None,
            attempts: 0,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    /// Undelivered and out of attempts.
    pub fn is_dead_lettered(&self, max_retries: u32) -> bool {
        !self.is_delivered() && self.attempts >= max_retries
    }
}

/// Counts across the outbox table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub delivered: usize,
    pub failed: usize,
    pub total: usize,
}

#[async_trait]
pub trait OutboxStore: Send + Sync + std::fmt::Debug {
    async fn append(&self, message: OutboxMessage) -> Result<(), StoreError>;

    async fn get_message(&self, id: &str) -> Result<Option<OutboxMessage>, StoreError>;

    /// Up to `limit` undelivered messages with `attempts < max_retries`, oldest first.
    async fn fetch_pending(&self, max_retries: u32, limit: usize)
        -> Result<Vec<OutboxMessage>, StoreError>;

    /// Set `delivered_at` and increment `attempts`.
    async fn mark_delivered(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Increment `attempts`, returning the new count.
    async fn increment_attempts(&self, id: &str) -> Result<u32, StoreError>;

    /// Delete delivered messages with `delivered_at < cutoff`.
    async fn purge_delivered_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Undelivered messages with `attempts >= max_retries`, oldest first.
    async fn dead_lettered(&self, max_retries: u32) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Reset `attempts` to 0 on an undelivered message. Returns false if none matched.
    async fn reset_attempts(&self, id: &str) -> Result<bool, StoreError>;

    async fn outbox_stats(&self, max_retries: u32) -> Result<OutboxStats, StoreError>;
}

/// `now + ttl` without panicking on huge TTLs.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(ttl)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn cache_entry_freshness_is_derived_from_age() {
        let clock = ManualClock::default();
        let entry = CacheEntry {
            class: "fx_rates".into(),
            fingerprint: "USD".into(),
            payload: Value::Null,
            source: "fx_primary".into(),
            fetched_at: clock.now(),
            ttl_secs: 60,
        };
        assert!(entry.is_fresh(clock.now()));
        clock.advance(Duration::from_secs(60));
        assert!(!entry.is_fresh(clock.now()));
        assert!(entry.is_within(clock.now(), Duration::from_secs(120)));
        clock.advance(Duration::from_secs(60));
        assert!(!entry.is_within(clock.now(), Duration::from_secs(120)));
    }

    #[test]
    fn open_only_while_timer_is_in_the_future() {
        let clock = ManualClock::default();
        let mut health = ProviderHealth::new("fx_primary");
        assert!(!health.is_open_at(clock.now()));
        health.circuit_open_until = Some(clock.now() + chrono::Duration::seconds(30));
        assert!(health.is_open_at(clock.now()));
        clock.advance(Duration::from_secs(30));
        assert!(!health.is_open_at(clock.now()));
    }

    #[test]
    fn dead_letter_requires_undelivered() {
        let clock = ManualClock::default();
        let mut msg = OutboxMessage::new("booking:created", Value::Null, clock.now());
        msg.attempts = 5;
        assert!(msg.is_dead_lettered(5));
        msg.delivered_at = Some(clock.now());
        assert!(!msg.is_dead_lettered(5));
    }

    #[test]
    fn status_serializes_in_upper_case() {
        let json = serde_json::to_string(&ProviderStatus::Degraded).unwrap();
        assert_eq!(json, "\"DEGRADED\"");
    }

    #[test]
    fn expiry_saturates() {
        let now = ManualClock::default().now();
        assert_eq!(expiry(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
