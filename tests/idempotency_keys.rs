use bulwark::idempotency::ExecuteError;
use bulwark::{Execution, IdempotencyKeyStore, IdempotencyStore, ManualClock, MemoryStore, PriorResponse};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn keys() -> (IdempotencyKeyStore, MemoryStore) {
    let store = MemoryStore::new();
    let keys = IdempotencyKeyStore::new(Arc::new(store.clone())).with_clock(ManualClock::default());
    (keys, store)
}

async fn create_booking(
    keys: &IdempotencyKeyStore,
    runs: &Arc<AtomicUsize>,
    body: Value,
) -> Result<Execution, ExecuteError<std::io::Error>> {
    let runs = runs.clone();
    keys.execute("booking-1", "/bookings", &body, &json!({"_t": 123}), move || async move {
        let id = runs.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({"bookingId": id}))
    })
    .await
}

#[tokio::test]
async fn identical_retry_replays_the_first_response() {
    let (keys, store) = keys();
    let runs = Arc::new(AtomicUsize::new(0));
    let first = create_booking(&keys, &runs, json!({"title": "Seoul", "timestamp": 1})).await.unwrap();
    let second = create_booking(&keys, &runs, json!({"timestamp": 2, "title": "Seoul"})).await.unwrap();

    assert_eq!(first, Execution::Executed(json!({"bookingId": 1})));
    assert_eq!(second, Execution::Replayed(json!({"bookingId": 1})));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(store.idempotency_len(), 1);
}

#[tokio::test]
async fn different_body_conflicts_and_leaves_the_record() {
    let (keys, store) = keys();
    let runs = Arc::new(AtomicUsize::new(0));
    create_booking(&keys, &runs, json!({"title": "Seoul"})).await.unwrap();
    let before = store.get_record("booking-1").await.unwrap();

    let err = create_booking(&keys, &runs, json!({"title": "Busan"})).await.unwrap_err();
    match err {
        ExecuteError::Idempotency(inner) => assert_eq!(inner.status_code(), 409),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(store.get_record("booking-1").await.unwrap(), before);
}

#[tokio::test]
async fn in_flight_duplicates_are_not_re_executed() {
    let (keys, _) = keys();
    let body = json!({"title": "Seoul"});
    assert_eq!(keys.begin("booking-1", "/bookings", &body, &Value::Null).await.unwrap(), None);

    let runs = Arc::new(AtomicUsize::new(0));
    let outcome = create_booking(&keys, &runs, body).await.unwrap();
    assert_eq!(outcome, Execution::InFlight);
    assert_eq!(outcome.value(), None);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        keys.begin("booking-1", "/bookings", &json!({"title": "Seoul"}), &Value::Null).await.unwrap(),
        Some(PriorResponse::InFlight)
    );
}
