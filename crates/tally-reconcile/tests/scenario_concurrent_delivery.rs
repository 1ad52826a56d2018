//! Scenario: concurrent deliveries against the same entities.
//!
//! The memory store's latency widens the gap between each read and its
//! write so interleavings actually happen on the multi-thread runtime.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tally_reconcile::{
    Coordinator, CoordinatorSettings, Rate, ReconcilePolicy, Reconciler, RetryPolicy,
};
use tally_schemas::{AttributeRef, EntityId, Micros};
use tally_store::{MemoryStore, StoreError, StoreOp};

fn id(s: &str) -> EntityId {
    EntityId::new(s).unwrap()
}

fn whole(n: i64) -> Micros {
    Micros::from_whole(n).unwrap()
}

fn setup(policy: ReconcilePolicy) -> (Arc<MemoryStore>, Arc<Coordinator>) {
    let store = Arc::new(MemoryStore::new(AttributeRef::new("ns", "total")));
    store.set_latency(Duration::from_millis(15));
    let rate = Rate::new(whole(1)).unwrap();
    let reconciler = Reconciler::new(policy, store.clone(), rate).with_source(store.clone());
    (
        store,
        Arc::new(Coordinator::new(
            Arc::new(reconciler),
            CoordinatorSettings::default(),
        )),
    )
}

fn body(event_id: &str, items: &[(&str, u64)]) -> Vec<u8> {
    let items: Vec<_> = items
        .iter()
        .map(|(e, q)| json!({ "entityId": e, "quantity": q }))
        .collect();
    json!({ "id": event_id, "paymentStatus": "paid", "lineItems": items })
        .to_string()
        .into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_concurrent_delivery_converges_under_recompute() {
    let (store, c) = setup(ReconcilePolicy::Recompute);
    store.set_units_sold(&id("789"), 35);
    store.set_units_sold(&id("456"), 50);

    let payload = body("order-1001", &[("789", 25), ("456", 50), ("789", 10)]);
    let (a, b) = tokio::join!(
        {
            let c = Arc::clone(&c);
            let p = payload.clone();
            async move { c.handle(&p).await }
        },
        {
            let c = Arc::clone(&c);
            let p = payload.clone();
            async move { c.handle(&p).await }
        }
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.failures.is_empty() && b.failures.is_empty());

    assert_eq!(store.total(&id("789")), Some(whole(35)));
    assert_eq!(store.total(&id("456")), Some(whole(50)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn incremental_lock_prevents_lost_updates() {
    let (store, c) = setup(ReconcilePolicy::Incremental);

    let mut handles = Vec::new();
    for (i, qty) in [25u64, 10, 5, 7, 3].into_iter().enumerate() {
        let c = Arc::clone(&c);
        let payload = body(&format!("order-{i}"), &[("789", qty)]);
        handles.push(tokio::spawn(async move { c.handle(&payload).await }));
    }
    for h in handles {
        let r = h.await.unwrap().unwrap();
        assert_eq!(r.processed_count, 1);
    }

    assert_eq!(store.total(&id("789")), Some(whole(50)));
    assert!(c.reconciler().locks().is_empty(), "lock table pruned");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_concurrent_delivery_applies_once_under_incremental() {
    let (store, c) = setup(ReconcilePolicy::Incremental);
    let payload = body("order-1001", &[("789", 25), ("456", 50), ("789", 10)]);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let c = Arc::clone(&c);
        let p = payload.clone();
        handles.push(tokio::spawn(async move { c.handle(&p).await }));
    }
    let mut processed = 0;
    let mut skipped = 0;
    for h in handles {
        let r = h.await.unwrap().unwrap();
        processed += r.processed_count;
        skipped += r.skipped_count;
    }
    assert_eq!(processed, 2, "each entity applied exactly once");
    assert_eq!(skipped, 4);
    assert_eq!(store.total(&id("789")), Some(whole(35)));
    assert_eq!(store.total(&id("456")), Some(whole(50)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_entities_run_in_parallel() {
    let (store, c) = setup(ReconcilePolicy::Recompute);
    let entities: Vec<String> = (1..=8).map(|n| n.to_string()).collect();
    for e in &entities {
        store.set_units_sold(&id(e), 1);
    }
    let items: Vec<(&str, u64)> = entities.iter().map(|e| (e.as_str(), 1)).collect();

    let started = std::time::Instant::now();
    let r = c.handle(&body("wide", &items)).await.unwrap();
    assert_eq!(r.processed_count, 8);
    // Serial execution would need 8 * (units_sold + set) * 15ms = 240ms.
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "took {:?}",
        started.elapsed()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_waiting_on_a_failed_delivery_applies_the_contribution() {
    let store = Arc::new(MemoryStore::new(AttributeRef::new("ns", "total")));
    store.set_latency(Duration::from_millis(15));
    let reconciler = Reconciler::new(
        ReconcilePolicy::Incremental,
        store.clone(),
        Rate::new(whole(1)).unwrap(),
    )
    .with_retry(RetryPolicy::none());
    let c = Arc::new(Coordinator::new(
        Arc::new(reconciler),
        CoordinatorSettings::default(),
    ));
    // Whichever delivery holds the claim hits this and gives up.
    store.fail_next(StoreOp::Set, &id("789"), StoreError::RateLimited("429".into()));

    let payload = body("order-7", &[("789", 5)]);
    let a = tokio::spawn({
        let (c, p) = (Arc::clone(&c), payload.clone());
        async move { c.handle(&p).await }
    });
    let b = tokio::spawn({
        let (c, p) = (Arc::clone(&c), payload.clone());
        async move { c.handle(&p).await }
    });
    let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());

    assert_eq!(a.processed_count + b.processed_count, 1);
    assert_eq!(a.failures.len() + b.failures.len(), 1);
    assert_eq!(a.skipped_count + b.skipped_count, 0);
    assert_eq!(store.total(&id("789")), Some(whole(5)));
}
