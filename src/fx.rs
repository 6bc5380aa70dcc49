//! Exchange-rate façade over [`ResilientFetcher`].

use crate::config::ConfigError;
use crate::error::{FetchError, ProviderError};
use crate::fetch::{CacheStatus, FetchRequest, ResilientFetcher, ResilientFetcherBuilder};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Rates for one base currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FxRates {
    pub base: String,
    pub rates: BTreeMap<String, f64>,
    pub status: CacheStatus,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

/// A single conversion rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FxRate {
    pub from: String,
    pub to: String,
    pub rate: f64,
    /// `None` when no lookup was needed (identical currencies).
    pub status: Option<CacheStatus>,
}

#[derive(Debug)]
pub struct FxService {
    fetcher: ResilientFetcher,
}

impl FxService {
    /// Install the rate normaliser on `builder` (normally for [`DataClass::fx_rates`](crate::DataClass::fx_rates)) and build.
    pub fn build(builder: ResilientFetcherBuilder) -> Result<Self, ConfigError> {
        let fetcher = builder.normalizer(|_, payload| normalize_rates(payload)).build()?;
        Ok(Self { fetcher })
    }

    pub fn fetcher(&self) -> &ResilientFetcher {
        &self.fetcher
    }

    /// Rates for `base`, fingerprinted by the upper-cased currency code.
    pub async fn get_rates(&self, base: &str) -> Result<FxRates, FetchError> {
        let base = base.trim().to_ascii_uppercase();
        let request = FetchRequest::new(base.clone()).param("base", base.clone());
        let fetched = self.fetcher.fetch(&request).await?;
        let rates = rates_from_value(&fetched.payload);
        Ok(FxRates {
            base,
            rates,
            status: fetched.status,
            source: fetched.source,
            fetched_at: fetched.fetched_at,
        })
    }

    /// Conversion rate; `1.0` without any lookup when `from == to`.
    pub async fn get_rate(&self, from: &str, to: &str) -> Result<FxRate, FetchError> {
        let from = from.trim().to_ascii_uppercase();
        let to = to.trim().to_ascii_uppercase();
        if from == to {
            return Ok(FxRate { from, to, rate: 1.0, status: None });
        }
        let rates = self.get_rates(&from).await?;
        match rates.rates.get(&to) {
            Some(rate) => Ok(FxRate { rate: *rate, from, to, status: Some(rates.status) }),
            None => Err(FetchError::Missing {
                class: self.fetcher.class().name.clone(),
                fingerprint: from,
                item: to,
            }),
        }
    }
}

/// Accepts `{"rates": {...}}`, `{"data": {"rates": ...}}`, a bare `{"KRW": 1300.5}` map, or a
/// `[{"quote": "KRW", "rate": 1300.5}]` list; always yields a map of numeric rates.
pub fn normalize_rates(payload: Value) -> Result<Value, ProviderError> {
    let inner = match payload {
        Value::Object(mut obj) => {
            if let Some(data) = obj.remove("data") {
                return normalize_rates(data);
            }
            match obj.remove("rates") {
                Some(rates) => rates,
                None => Value::Object(obj),
            }
        }
        other => other,
    };
    let mut out = Map::new();
    match inner {
        Value::Object(map) => {
            for (quote, rate) in map {
                if let Some(rate) = rate.as_f64() {
                    out.insert(quote.to_ascii_uppercase(), Value::from(rate));
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let quote = item.get("quote").and_then(Value::as_str);
                let rate = item.get("rate").and_then(Value::as_f64);
                if let (Some(quote), Some(rate)) = (quote, rate) {
                    out.insert(quote.to_ascii_uppercase(), Value::from(rate));
                }
            }
        }
        other => {
            return Err(ProviderError::Decode(format!("unexpected rates payload: {other}")));
        }
    }
    if out.is_empty() {
        return Err(ProviderError::Decode("rates payload contained no numeric rates".into()));
    }
    Ok(Value::Object(out))
}

fn rates_from_value(value: &Value) -> BTreeMap<String, f64> {
    value
        .as_object()
        .map(|map| map.iter().filter_map(|(k, v)| v.as_f64().map(|r| (k.clone(), r))).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::cache::DataClass;
    use crate::circuit_breaker::CircuitProfile;
    use crate::clock::ManualClock;
    use crate::fetch::testing::ScriptedProvider;
    use crate::sleeper::InstantSleeper;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn service(primary: Arc<ScriptedProvider>) -> FxService {
        let store = MemoryStore::new();
        let builder = ResilientFetcher::builder(
            DataClass::fx_rates(),
            Arc::new(store.clone()),
            Arc::new(store),
        )
        .sleeper(Arc::new(InstantSleeper))
        .clock(Arc::new(ManualClock::default()))
        .provider(primary, CircuitProfile::CRITICAL, BackoffPolicy::default_policy());
        FxService::build(builder).unwrap()
    }

    #[test]
    fn normalizes_supported_shapes() {
        let expected = json!({"KRW": 1300.5, "JPY": 150.0});
        assert_eq!(normalize_rates(json!({"rates": {"KRW": 1300.5, "JPY": 150.0}})).unwrap(), expected);
        assert_eq!(normalize_rates(json!({"data": {"rates": {"krw": 1300.5, "JPY": 150}}})).unwrap(), expected);
        assert_eq!(normalize_rates(json!({"KRW": 1300.5, "JPY": 150.0, "note": "x"})).unwrap(), expected);
        assert_eq!(
            normalize_rates(json!([{"quote": "KRW", "rate": 1300.5}, {"quote": "JPY", "rate": 150.0}]))
                .unwrap(),
            expected
        );
    }

    #[test]
    fn rejects_unusable_payloads() {
        assert!(normalize_rates(json!("nope")).is_err());
        assert!(normalize_rates(json!({"rates": {}})).is_err());
    }

    #[tokio::test]
    async fn identical_currencies_skip_the_lookup() {
        let primary = ScriptedProvider::new("fx_primary", vec![Err(ProviderError::status(500))]);
        let fx = service(primary.clone());
        let rate = fx.get_rate("usd", "USD").await.unwrap();
        assert_eq!(rate.rate, 1.0);
        assert_eq!(rate.status, None);
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn get_rate_reads_normalized_rates() {
        let primary = ScriptedProvider::new("fx_primary", vec![Ok(json!({"rates": {"KRW": 1300.5}}))]);
        let fx = service(primary);
        let rate = fx.get_rate("USD", "krw").await.unwrap();
        assert_eq!(rate.rate, 1300.5);
        assert_eq!(rate.status, Some(CacheStatus::Miss));

        let rates = fx.get_rates("USD").await.unwrap();
        assert_eq!(rates.status, CacheStatus::Hit);
        assert_eq!(rates.rates.get("KRW"), Some(&1300.5));
    }

    #[tokio::test]
    async fn unknown_quote_is_missing() {
        let primary = ScriptedProvider::new("fx_primary", vec![Ok(json!({"KRW": 1300.5}))]);
        let fx = service(primary);
        let err = fx.get_rate("USD", "EUR").await.unwrap_err();
        assert!(matches!(err, FetchError::Missing { ref item, .. } if item == "EUR"));
        assert_eq!(fx.fetcher().class().name, "fx_rates");
    }
}
