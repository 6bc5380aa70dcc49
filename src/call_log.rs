//! Call log: one record per provider attempt, cache hit, stale fallback or terminal failure.
//!
//! The log is a best-effort sink. [`record_best_effort`] swallows sink failures (logging them)
//! so observability never changes the outcome of a fetch. [`MemoryCallLog`] keeps a bounded
//! window in memory and answers the health questions dashboards ask: error rate over a window,
//! per-provider health, and a summary.

use crate::clock::{to_chrono, Clock, SystemClock};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Provider label used for fresh cache hits.
pub const CACHE_PROVIDER: &str = "cache";
/// Provider label used for stale cache fallbacks.
pub const STALE_CACHE_PROVIDER: &str = "cache_stale";
/// Error type recorded when every fallback was exhausted.
pub const SERVICE_ERROR: &str = "SERVICE_ERROR";
/// Error type recorded when the breaker rejected a call.
pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";

/// A single observed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    pub provider: String,
    pub endpoint: String,
    pub method: String,
    pub status_code: Option<u16>,
    pub error_type: Option<String>,
    pub duration_ms: u64,
    pub occurred_at: DateTime<Utc>,
}

impl CallRecord {
    /// A call counts as an error when it carries a status >= 400 or an error type.
    pub fn is_error(&self) -> bool {
        self.status_code.is_some_and(|s| s >= 400) || self.error_type.is_some()
    }
}

/// Destination for call records.
#[async_trait]
pub trait CallLog: Send + Sync + std::fmt::Debug {
    async fn record(&self, record: CallRecord) -> Result<(), StoreError>;
}

/// Record without letting a sink failure escape.
pub async fn record_best_effort(log: &dyn CallLog, record: CallRecord) {
    let provider = record.provider.clone();
    if let Err(err) = log.record(record).await {
        tracing::warn!(target: "bulwark::call_log", %provider, error = %err, "failed to write call record");
    }
}

/// Discards every record.
#[derive(Clone, Debug, Default)]
pub struct NullCallLog;

#[async_trait]
impl CallLog for NullCallLog {
    async fn record(&self, _record: CallRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Logs every record through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct TracingCallLog;

#[async_trait]
impl CallLog for TracingCallLog {
    async fn record(&self, record: CallRecord) -> Result<(), StoreError> {
        tracing::info!(
            target: "bulwark::call_log",
            provider = %record.provider,
            endpoint = %record.endpoint,
            method = %record.method,
            status = record.status_code,
            error_type = record.error_type.as_deref(),
            duration_ms = record.duration_ms,
            "provider_call"
        );
        Ok(())
    }
}

/// Health verdict for one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderCallHealth {
    pub provider: String,
    pub healthy: bool,
    pub error_rate_last_hour: f64,
    pub error_rate_last_5min: f64,
}

/// Aggregate over a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSummary {
    pub total_calls: usize,
    /// Percentage of non-error calls, 0-100.
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub calls_by_provider: BTreeMap<String, usize>,
    pub errors_by_type: BTreeMap<String, usize>,
}

/// Error-rate ceilings used by [`MemoryCallLog::provider_health`].
pub const MAX_ERROR_RATE_HOUR: f64 = 0.10;
pub const MAX_ERROR_RATE_5MIN: f64 = 0.25;

/// Bounded in-memory call log; the oldest record is evicted at capacity.
#[derive(Clone, Debug)]
pub struct MemoryCallLog {
    records: Arc<Mutex<VecDeque<CallRecord>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl MemoryCallLog {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<CallRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn records(&self) -> Vec<CallRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Records for one provider, oldest first.
    pub fn records_for(&self, provider: &str) -> Vec<CallRecord> {
        self.lock().iter().filter(|r| r.provider == provider).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn since(&self, window: Duration) -> DateTime<Utc> {
        self.clock.now() - to_chrono(window)
    }

    /// Fraction of erroring calls to `provider` within `window`; 0 when there were none.
    pub fn error_rate(&self, provider: &str, window: Duration) -> f64 {
        let since = self.since(window);
        let records = self.lock();
        let (total, errors) = records
            .iter()
            .filter(|r| r.provider == provider && r.occurred_at >= since)
            .fold((0usize, 0usize), |(total, errors), r| {
                (total + 1, errors + usize::from(r.is_error()))
            });
        if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        }
    }

    /// Healthy iff the error rate is <= 10% over the last hour and <= 25% over the last 5 minutes.
    pub fn provider_health(&self, provider: &str) -> ProviderCallHealth {
        let hour = self.error_rate(provider, Duration::from_secs(60 * 60));
        let five = self.error_rate(provider, Duration::from_secs(5 * 60));
        ProviderCallHealth {
            provider: provider.to_string(),
            healthy: hour <= MAX_ERROR_RATE_HOUR && five <= MAX_ERROR_RATE_5MIN,
            error_rate_last_hour: hour,
            error_rate_last_5min: five,
        }
    }

    pub fn summary(&self, window: Duration) -> CallSummary {
        let since = self.since(window);
        let records = self.lock();
        let mut summary = CallSummary {
            total_calls: 0,
            success_rate: 0.0,
            avg_duration_ms: 0.0,
            calls_by_provider: BTreeMap::new(),
            errors_by_type: BTreeMap::new(),
        };
        let mut successes = 0usize;
        let mut duration_total = 0u64;
        for record in records.iter().filter(|r| r.occurred_at >= since) {
            summary.total_calls += 1;
            duration_total = duration_total.saturating_add(record.duration_ms);
            *summary.calls_by_provider.entry(record.provider.clone()).or_default() += 1;
            if record.is_error() {
                let kind = record.error_type.clone().unwrap_or_else(|| {
                    record.status_code.map_or_else(|| "UNKNOWN".to_string(), |s| format!("HTTP_{s}"))
                });
                *summary.errors_by_type.entry(kind).or_default() += 1;
            } else {
                successes += 1;
            }
        }
        if summary.total_calls > 0 {
            summary.success_rate = successes as f64 * 100.0 / summary.total_calls as f64;
            summary.avg_duration_ms = duration_total as f64 / summary.total_calls as f64;
        }
        summary
    }

    /// Drop records older than `cutoff`. Returns how many were removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| r.occurred_at >= cutoff);
        before - records.len()
    }
}

impl Default for MemoryCallLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallLog for MemoryCallLog {
    async fn record(&self, record: CallRecord) -> Result<(), StoreError> {
        let mut records = self.lock();
        if records.len() >= self.capacity {
            records.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
        Ok(())
    }
}
