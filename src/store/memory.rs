use super::{
    Admission, CacheEntry, CacheStore, HealthStore, IdempotencyRecord, IdempotencyStore,
    OutboxMessage, OutboxStats, OutboxStore, ProviderHealth, ProviderStatus, SuccessRecord,
};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    health: HashMap<String, ProviderHealth>,
    cache: HashMap<(String, String), CacheEntry>,
    idempotency: HashMap<String, IdempotencyRecord>,
    // Insertion order doubles as the tie-breaker for equal `created_at`.
    outbox: Vec<OutboxMessage>,
}

/// In-memory implementation of every store trait.
///
/// Each trait call takes the lock once, so each call is atomic with respect to the others.
/// Clones share the same tables.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of idempotency records currently held, expired ones included.
    pub fn idempotency_len(&self) -> usize {
        self.lock().idempotency.len()
    }

    /// Number of cache entries across all classes.
    pub fn cache_len(&self) -> usize {
        self.lock().cache.len()
    }
}

#[async_trait]
impl HealthStore for MemoryStore {
    async fn get_health(&self, name: &str) -> Result<Option<ProviderHealth>, StoreError> {
        Ok(self.lock().health.get(name).cloned())
    }

    async fn admit(&self, name: &str, now: DateTime<Utc>) -> Result<Admission, StoreError> {
        let mut tables = self.lock();
        let row = tables
            .health
            .entry(name.to_string())
            .or_insert_with(|| ProviderHealth::new(name));
        let half_opened = match row.circuit_open_until {
            Some(until) if until <= now => {
                row.circuit_open_until = None;
                row.status = ProviderStatus::Degraded;
                true
            }
            _ => false,
        };
        Ok(Admission { health: row.clone(), half_opened })
    }

    async fn record_success(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<SuccessRecord, StoreError> {
        let mut tables = self.lock();
        let previous = tables.health.get(name).map(|row| row.status);
        let row = tables
            .health
            .entry(name.to_string())
            .or_insert_with(|| ProviderHealth::new(name));
        row.status = ProviderStatus::Healthy;
        row.error_count = 0;
        row.circuit_open_until = None;
        row.last_success_at = Some(now);
        Ok(SuccessRecord { previous, health: row.clone() })
    }

    async fn record_failure(
        &self,
        name: &str,
        now: DateTime<Utc>,
        threshold: u32,
        open_until: DateTime<Utc>,
    ) -> Result<ProviderHealth, StoreError> {
        let mut tables = self.lock();
        let row = tables
            .health
            .entry(name.to_string())
            .or_insert_with(|| ProviderHealth::new(name));
        row.error_count = row.error_count.saturating_add(1);
        row.last_error_at = Some(now);
        if row.error_count >= threshold {
            row.status = ProviderStatus::Down;
            row.circuit_open_until = Some(open_until);
        } else {
            row.status = ProviderStatus::Degraded;
        }
        Ok(row.clone())
    }

    async fn reset_health(&self, name: &str) -> Result<ProviderHealth, StoreError> {
        let mut tables = self.lock();
        let row = tables
            .health
            .entry(name.to_string())
            .or_insert_with(|| ProviderHealth::new(name));
        row.status = ProviderStatus::Healthy;
        row.error_count = 0;
        row.circuit_open_until = None;
        Ok(row.clone())
    }

    async fn list_health(&self) -> Result<Vec<ProviderHealth>, StoreError> {
        let mut rows: Vec<_> = self.lock().health.values().cloned().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_entry(
        &self,
        class: &str,
        fingerprint: &str,
    ) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.lock().cache.get(&(class.to_string(), fingerprint.to_string())).cloned())
    }

    async fn put_entry(&self, entry: CacheEntry) -> Result<(), StoreError> {
        let key = (entry.class.clone(), entry.fingerprint.clone());
        self.lock().cache.insert(key, entry);
        Ok(())
    }

    async fn purge_entries_before(
        &self,
        class: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut tables = self.lock();
        let before = tables.cache.len();
        tables.cache.retain(|(c, _), entry| c != class || entry.fetched_at >= cutoff);
        Ok(before - tables.cache.len())
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn insert_if_absent(
        &self,
        record: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let mut tables = self.lock();
        if let Some(existing) = tables.idempotency.get(&record.key) {
            return Ok(Some(existing.clone()));
        }
        tables.idempotency.insert(record.key.clone(), record);
        Ok(None)
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self.lock().idempotency.get(key).cloned())
    }

    async fn complete_record(&self, key: &str, response: Value) -> Result<bool, StoreError> {
        match self.lock().idempotency.get_mut(key) {
            Some(record) => {
                record.response_body = Some(response);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_record(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().idempotency.remove(key).is_some())
    }

    async fn delete_if_expired(&self, key: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        let expired = tables.idempotency.get(key).is_some_and(|r| r.is_expired(now));
        if expired {
            tables.idempotency.remove(key);
        }
        Ok(expired)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.lock();
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, r| !r.is_expired(now));
        Ok(before - tables.idempotency.len())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn append(&self, message: OutboxMessage) -> Result<(), StoreError> {
        self.lock().outbox.push(message);
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<OutboxMessage>, StoreError> {
        Ok(self.lock().outbox.iter().find(|m| m.id == id).cloned())
    }

    async fn fetch_pending(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let tables = self.lock();
        let mut pending: Vec<_> = tables
            .outbox
            .iter()
            .filter(|m| !m.is_delivered() && m.attempts < max_retries)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_delivered(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.lock();
        let message = tables
            .outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::not_found("outbox message", id))?;
        message.delivered_at = Some(at);
        message.attempts = message.attempts.saturating_add(1);
        Ok(())
    }

    async fn increment_attempts(&self, id: &str) -> Result<u32, StoreError> {
        let mut tables = self.lock();
        let message = tables
            .outbox
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::not_found("outbox message", id))?;
        message.attempts = message.attempts.saturating_add(1);
        Ok(message.attempts)
    }

    async fn purge_delivered_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tables = self.lock();
        let before = tables.outbox.len();
        tables.outbox.retain(|m| m.delivered_at.map_or(true, |at| at >= cutoff));
        Ok(before - tables.outbox.len())
    }

    async fn dead_lettered(&self, max_retries: u32) -> Result<Vec<OutboxMessage>, StoreError> {
        let tables = self.lock();
        let mut failed: Vec<_> =
            tables.outbox.iter().filter(|m| m.is_dead_lettered(max_retries)).cloned().collect();
        failed.sort_by_key(|m| m.created_at);
        Ok(failed)
    }

    async fn reset_attempts(&self, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.lock();
        match tables.outbox.iter_mut().find(|m| m.id == id && !m.is_delivered()) {
            Some(message) => {
                message.attempts = 0;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn outbox_stats(&self, max_retries: u32) -> Result<OutboxStats, StoreError> {
        let tables = self.lock();
        let mut stats = OutboxStats { total: tables.outbox.len(), ..OutboxStats::default() };
        for message in &tables.outbox {
            if message.is_delivered() {
                stats.delivered += 1;
            } else if message.attempts >= max_retries {
                stats.failed += 1;
            } else {
                stats.pending += 1;
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn admit_creates_rows_lazily() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        assert!(store.get_health("fx_primary").await.unwrap().is_none());

        let admission = store.admit("fx_primary", clock.now()).await.unwrap();
        assert_eq!(admission.health, ProviderHealth::new("fx_primary"));
        assert!(!admission.half_opened);
        assert!(store.get_health("fx_primary").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn admit_clears_elapsed_timer() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let until = clock.now() + chrono::Duration::seconds(10);
        store.record_failure("p", clock.now(), 1, until).await.unwrap();

        let early = store.admit("p", clock.now()).await.unwrap();
        assert!(!early.half_opened);
        assert_eq!(early.health.circuit_open_until, Some(until));

        clock.advance(Duration::from_secs(10));
        let later = store.admit("p", clock.now()).await.unwrap();
        assert!(later.half_opened);
        assert_eq!(later.health.circuit_open_until, None);
        assert_eq!(later.health.status, ProviderStatus::Degraded);
        assert_eq!(later.health.error_count, 1);
    }

    #[tokio::test]
    async fn record_success_reports_replaced_status() {
        let store = MemoryStore::new();
        let now = ManualClock::default().now();
        let first = store.record_success("p", now).await.unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.health.status, ProviderStatus::Healthy);

        store.record_failure("p", now, 1, now).await.unwrap();
        let recovered = store.record_success("p", now).await.unwrap();
        assert_eq!(recovered.previous, Some(ProviderStatus::Down));
        assert_eq!(recovered.health.error_count, 0);
        assert_eq!(recovered.health.last_success_at, Some(now));
    }

    #[tokio::test]
    async fn failures_below_threshold_degrade() {
        let store = MemoryStore::new();
        let now = ManualClock::default().now();
        let row = store.record_failure("p", now, 3, now).await.unwrap();
        assert_eq!(row.status, ProviderStatus::Degraded);
        assert_eq!(row.circuit_open_until, None);
        assert_eq!(row.last_error_at, Some(now));
    }

    #[tokio::test]
    async fn cache_upserts_by_class_and_fingerprint() {
        let store = MemoryStore::new();
        let now = ManualClock::default().now();
        let entry = |payload| CacheEntry {
            class: "fx_rates".into(),
            fingerprint: "USD".into(),
            payload,
            source: "fx_primary".into(),
            fetched_at: now,
            ttl_secs: 60,
        };
        store.put_entry(entry(json!(1))).await.unwrap();
        store.put_entry(entry(json!(2))).await.unwrap();
        assert_eq!(store.cache_len(), 1);
        let got = store.get_entry("fx_rates", "USD").await.unwrap().unwrap();
        assert_eq!(got.payload, json!(2));
        assert!(store.get_entry("flight_status", "USD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_if_absent_returns_existing() {
        let store = MemoryStore::new();
        let now = ManualClock::default().now();
        let record = IdempotencyRecord {
            key: "k".into(),
            endpoint: "/bookings".into(),
            request_hash: "h1".into(),
            response_body: None,
            created_at: now,
            expires_at: now + chrono::Duration::minutes(30),
        };
        assert!(store.insert_if_absent(record.clone()).await.unwrap().is_none());
        let mut other = record.clone();
        other.request_hash = "h2".into();
        let existing = store.insert_if_absent(other).await.unwrap().unwrap();
        assert_eq!(existing.request_hash, "h1");
        assert_eq!(store.idempotency_len(), 1);
    }

    #[tokio::test]
    async fn outbox_lifecycle_counts() {
        let store = MemoryStore::new();
        let clock = ManualClock::default();
        let a = OutboxMessage::new("booking:created", json!({}), clock.now());
        clock.advance(Duration::from_secs(1));
        let b = OutboxMessage::new("booking:updated", json!({}), clock.now());
        store.append(b.clone()).await.unwrap();
        store.append(a.clone()).await.unwrap();

        let pending = store.fetch_pending(5, 10).await.unwrap();
        assert_eq!(pending.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), [&a.id, &b.id]);

        store.mark_delivered(&a.id, clock.now()).await.unwrap();
        for _ in 0..5 {
            store.increment_attempts(&b.id).await.unwrap();
        }
        let stats = store.outbox_stats(5).await.unwrap();
        assert_eq!(stats, OutboxStats { pending: 0, delivered: 1, failed: 1, total: 2 });
        assert_eq!(store.get_message(&a.id).await.unwrap().unwrap().attempts, 1);

        assert!(store.reset_attempts(&b.id).await.unwrap());
        assert!(!store.reset_attempts(&a.id).await.unwrap());
        assert_eq!(store.fetch_pending(5, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_message_ids_are_not_found() {
        let store = MemoryStore::new();
        let err = store.increment_attempts("missing").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
