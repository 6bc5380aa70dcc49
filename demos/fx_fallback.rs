//! Exchange-rate fallback walkthrough.
//!
//! A flaky primary and a healthy fallback feed one FX service; then both go down and the
//! service keeps answering from the stale cache. Finishes with an idempotent booking and its
//! outbox delivery.

use async_trait::async_trait;
use bulwark::handlers::{TracingBroadcaster, TOPIC_BOOKING_CREATED};
use bulwark::{
    BulwarkConfig, Clock, DataClass, FetchRequest, FxService, HandlerRegistry, ManualClock, MemoryCallLog,
    MemoryStore, NetworkErrorKind, OutboxDispatcher, Provider, ProviderError, ResilientFetcher,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct SimulatedRates {
    name: &'static str,
    rate: f64,
    up: AtomicBool,
}

impl SimulatedRates {
    fn new(name: &'static str, rate: f64, up: bool) -> Arc<Self> {
        Arc::new(Self { name, rate, up: AtomicBool::new(up) })
    }
}

#[async_trait]
impl Provider for SimulatedRates {
    fn name(&self) -> &str {
        self.name
    }

    async fn fetch(&self, _request: &FetchRequest) -> Result<Value, ProviderError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(json!({"rates": {"KRW": self.rate, "JPY": self.rate / 9.0}}))
        } else {
            Err(ProviderError::network(NetworkErrorKind::ConnectionRefused, "connection refused"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(true).init();

    let config = BulwarkConfig::from_json_str(
        r#"{
            "providers": {
                "fx_primary": {"profile": "CRITICAL", "retry": "DEFAULT"},
                "fx_fallback": {"profile": "FAST", "retry": "CONSERVATIVE"}
            },
            "dispatcher": {"interval_ms": 200}
        }"#,
    )?;

    let store = MemoryStore::new();
    let clock = ManualClock::default();
    let calls = MemoryCallLog::new().with_clock(clock.clone());
    let primary = SimulatedRates::new("fx_primary", 1300.5, false);
    let fallback = SimulatedRates::new("fx_fallback", 1299.0, true);

    let mut builder = ResilientFetcher::builder(
        config.data_class("fx_rates").unwrap_or_else(DataClass::fx_rates),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
    )
    .clock(Arc::new(clock.clone()))
    .call_log(Arc::new(calls.clone()));
    for provider in [primary.clone(), fallback.clone()] {
        let settings = config.provider(provider.name());
        builder = builder.provider(provider, settings.circuit_profile(), settings.backoff());
    }
    let fx = FxService::build(builder)?;

    println!("=== FX fallback ===\n");
    let rate = fx.get_rate("usd", "krw").await?;
    println!("1. primary down     -> {:.1} ({:?})", rate.rate, rate.status);
    let rate = fx.get_rate("USD", "KRW").await?;
    println!("2. within TTL       -> {:.1} ({:?})", rate.rate, rate.status);

    fallback.up.store(false, Ordering::SeqCst);
    clock.advance(Duration::from_secs(25 * 3600));
    let rate = fx.get_rate("USD", "KRW").await?;
    println!("3. all down, 25h on -> {:.1} ({:?})", rate.rate, rate.status);

    let summary = calls.summary(Duration::from_secs(48 * 3600));
    println!("\ncalls: {} total, {:.0}% ok", summary.total_calls, summary.success_rate * 100.0);
    for (error, count) in &summary.errors_by_type {
        println!("  {error}: {count}");
    }
    let health = fx.fetcher().health().await?;
    println!("fetcher health: {}", health.status.as_str());

    println!("\n=== Idempotent booking + outbox ===\n");
    let keys = config.idempotency.build(Arc::new(store.clone()));
    let outbox = OutboxDispatcher::with_config(
        Arc::new(store.clone()),
        HandlerRegistry::with_defaults(Arc::new(TracingBroadcaster)),
        config.dispatcher.to_config(),
    );
    let key = keys.generate_key("booking");
    let body = json!({"title": "Seoul trip", "timestamp": clock.now().timestamp()});
    for attempt in 1..=2 {
        let outcome = keys
            .execute(&key, "/bookings", &body, &Value::Null, || async {
                let message = outbox
                    .enqueue(TOPIC_BOOKING_CREATED, json!({"bookingId": 42, "type": "create", "data": body}))
                    .await?;
                Ok::<_, bulwark::StoreError>(json!({"bookingId": 42, "outbox": message.id}))
            })
            .await?;
        println!("attempt {attempt}: {outcome:?}");
    }

    outbox.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    outbox.stop().await;
    println!("outbox: {:?}", outbox.stats().await?);
    Ok(())
}
