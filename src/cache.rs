//! Data classes: freshness TTL and hard staleness ceiling per kind of cached result.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Caching rules shared by every request of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataClass {
    /// Cache namespace and call-log label (`fx_rates` logs terminal failures as `fx_rates_service`).
    pub name: String,
    pub ttl_secs: u64,
    /// Entries older than this are never served, not even as stale.
    pub stale_ceiling_secs: u64,
}

impl DataClass {
    pub fn new(name: impl Into<String>, ttl: Duration, stale_ceiling: Duration) -> Self {
        Self {
            name: name.into(),
            ttl_secs: ttl.as_secs(),
            stale_ceiling_secs: stale_ceiling.as_secs().max(ttl.as_secs()),
        }
    }

    /// Exchange rates: fresh for 24h, stale for up to 7 days.
    pub fn fx_rates() -> Self {
        Self::new("fx_rates", Duration::from_secs(24 * 3600), Duration::from_secs(7 * 24 * 3600))
    }

    /// Flight schedules: fresh for 1h, stale for up to 3 days.
    pub fn flight_schedule() -> Self {
        Self::new("flight_schedule", Duration::from_secs(3600), Duration::from_secs(3 * 24 * 3600))
    }

    /// Live flight status: fresh for 5 minutes, stale for up to 2 hours.
    pub fn flight_status() -> Self {
        Self::new("flight_status", Duration::from_secs(300), Duration::from_secs(2 * 3600))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn stale_ceiling(&self) -> Duration {
        Duration::from_secs(self.stale_ceiling_secs)
    }

    /// Provider label used in the call log for a terminal failure.
    pub fn service_label(&self) -> String {
        format!("{}_service", self.name)
    }
}
