//! Flight schedule and live status façade: two data classes, one pipeline each.

use crate::config::ConfigError;
use crate::error::{FetchError, ProviderError};
use crate::fetch::{CacheStatus, FetchRequest, ResilientFetcher, ResilientFetcherBuilder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ANY: &str = "ANY";

/// Schedule search filters; unset filters match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightSearch {
    pub departure: Option<String>,
    pub arrival: Option<String>,
    /// ISO date, `YYYY-MM-DD`.
    pub date: Option<String>,
    pub airline: Option<String>,
}

impl FlightSearch {
    /// `DEP_ARR_DATE_AIRLINE`, with `ANY` for unset filters.
    pub fn fingerprint(&self) -> String {
        let part = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).unwrap_or(ANY).to_string();
        format!(
            "{}_{}_{}_{}",
            part(&self.departure),
            part(&self.arrival),
            part(&self.date),
            part(&self.airline)
        )
    }

    fn to_request(&self) -> FetchRequest {
        let mut request = FetchRequest::new(self.fingerprint());
        let filters = [
            ("departure", &self.departure),
            ("arrival", &self.arrival),
            ("date", &self.date),
            ("airline", &self.airline),
        ];
        for (key, value) in filters {
            if let Some(value) = value.as_deref().filter(|s| !s.is_empty()) {
                request = request.param(key, value);
            }
        }
        request
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlightSchedules {
    pub flights: Vec<Value>,
    pub status: CacheStatus,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub age_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlightStatusReport {
    pub flight_no: String,
    pub date: String,
    pub details: Value,
    pub status: CacheStatus,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
    pub age_secs: u64,
}

#[derive(Debug)]
pub struct FlightService {
    schedule: ResilientFetcher,
    status: ResilientFetcher,
}

impl FlightService {
    /// `schedule` is normally built for [`DataClass::flight_schedule`](crate::DataClass::flight_schedule),
    /// `status` for [`DataClass::flight_status`](crate::DataClass::flight_status).
    ///
    /// A provider serving both classes gets one half-open probe bound: builders without a
    /// registry of their own share the other builder's, or a new common one.
    pub fn build(
        schedule: ResilientFetcherBuilder,
        status: ResilientFetcherBuilder,
    ) -> Result<Self, ConfigError> {
        let shared = schedule
            .configured_registry()
            .or_else(|| status.configured_registry())
            .cloned()
            .unwrap_or_default();
        let schedule = schedule.registry_or(&shared);
        let status = status.registry_or(&shared);
        Ok(Self {
            schedule: schedule.normalizer(|_, payload| normalize_schedule(payload)).build()?,
            status: status.normalizer(|_, payload| normalize_status(payload)).build()?,
        })
    }

    pub fn schedule_fetcher(&self) -> &ResilientFetcher {
        &self.schedule
    }

    pub fn status_fetcher(&self) -> &ResilientFetcher {
        &self.status
    }

    pub async fn search(&self, search: &FlightSearch) -> Result<FlightSchedules, FetchError> {
        let fetched = self.schedule.fetch(&search.to_request()).await?;
        let flights = match fetched.payload {
            Value::Array(items) => items,
            other => vec![other],
        };
        Ok(FlightSchedules {
            flights,
            status: fetched.status,
            source: fetched.source,
            fetched_at: fetched.fetched_at,
            age_secs: fetched.age_secs,
        })
    }

    /// Live status keyed `flightNo_date`.
    pub async fn status(&self, flight_no: &str, date: &str) -> Result<FlightStatusReport, FetchError> {
        let flight_no = flight_no.trim().to_ascii_uppercase();
        let request = FetchRequest::new(format!("{flight_no}_{date}"))
            .param("flightNo", flight_no.clone())
            .param("date", date);
        let fetched = self.status.fetch(&request).await?;
        Ok(FlightStatusReport {
            flight_no,
            date: date.to_string(),
            details: fetched.payload,
            status: fetched.status,
            source: fetched.source,
            fetched_at: fetched.fetched_at,
            age_secs: fetched.age_secs,
        })
    }
}

/// Accepts a bare list, `{"items": [...]}`, or the public-data envelope
/// `{"response": {"body": {"items": {"item": ...}}}}` where `item` may be a single object.
pub fn normalize_schedule(payload: Value) -> Result<Value, ProviderError> {
    let items = match payload {
        Value::Array(_) => payload,
        Value::Object(ref obj) => {
            if let Some(items) = obj.get("items") {
                items.clone()
            } else if let Some(item) = payload.pointer("/response/body/items/item") {
                item.clone()
            } else if payload.pointer("/response/body").is_some() {
                // An envelope without items is an empty result, not a malformed one.
                Value::Array(Vec::new())
            } else {
                return Err(ProviderError::Decode("schedule payload has no items".into()));
            }
        }
        other => return Err(ProviderError::Decode(format!("unexpected schedule payload: {other}"))),
    };
    match items {
        Value::Array(_) => Ok(items),
        Value::Object(_) => Ok(Value::Array(vec![items])),
        other => Err(ProviderError::Decode(format!("unexpected schedule items: {other}"))),
    }
}

/// A status payload must be an object; `{"data": {...}}` is unwrapped.
pub fn normalize_status(payload: Value) -> Result<Value, ProviderError> {
    match payload {
        Value::Object(mut obj) => match obj.remove("data") {
            Some(inner @ Value::Object(_)) => Ok(inner),
            Some(other) => {
                obj.insert("data".to_string(), other);
                Ok(Value::Object(obj))
            }
            None => Ok(Value::Object(obj)),
        },
        other => Err(ProviderError::Decode(format!("unexpected status payload: {other}"))),
    }
}
