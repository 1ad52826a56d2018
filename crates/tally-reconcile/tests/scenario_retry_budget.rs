//! Scenario: retry, backoff exhaustion and store-unavailable escalation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tally_reconcile::{
    Coordinator, CoordinatorSettings, ErrorKind, IngestError, Rate, ReconcileError,
    ReconcileInput, ReconcilePolicy, Reconciler, RetryPolicy,
};
use tally_schemas::{AttributeRef, EntityId, Micros};
use tally_store::{MemoryStore, StoreError, StoreOp};

fn id(s: &str) -> EntityId {
    EntityId::new(s).unwrap()
}

fn whole(n: i64) -> Micros {
    Micros::from_whole(n).unwrap()
}

fn retry(max_attempts: u32, unavailable_ceiling: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        unavailable_ceiling,
    }
}

fn reconciler(policy: ReconcilePolicy, retry: RetryPolicy) -> (Arc<MemoryStore>, Reconciler) {
    let store = Arc::new(MemoryStore::new(AttributeRef::new("ns", "total")));
    let r = Reconciler::new(policy, store.clone(), Rate::new(whole(1)).unwrap())
        .with_source(store.clone())
        .with_retry(retry);
    (store, r)
}

fn unavailable() -> StoreError {
    StoreError::Unavailable {
        status: Some(503),
        message: "maintenance".into(),
    }
}

#[tokio::test]
async fn transient_failures_then_success() {
    let (store, r) = reconciler(ReconcilePolicy::Recompute, retry(4, 2));
    store.set_units_sold(&id("789"), 35);
    store.fail_next(StoreOp::Set, &id("789"), StoreError::Transport("reset".into()));
    store.fail_next(StoreOp::Set, &id("789"), StoreError::RateLimited("429".into()));

    let total = r.reconcile(&id("789"), ReconcileInput::Recompute).await.unwrap();
    assert_eq!(total, whole(35));
    assert_eq!(store.calls().set, 3);
    assert_eq!(store.total(&id("789")), Some(whole(35)));
}

#[tokio::test]
async fn exhausted_budget_reports_transient_and_keeps_prior_value() {
    let (store, r) = reconciler(ReconcilePolicy::Incremental, retry(3, 2));
    store.seed_total(&id("789"), whole(20));
    store.fail_always(StoreOp::Set, &id("789"), StoreError::RateLimited("429".into()));

    let err = r
        .reconcile(&id("789"), ReconcileInput::Contribution(whole(5)))
        .await
        .unwrap_err();
    match &err {
        ReconcileError::Transient { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected Transient, got {other:?}"),
    }
    assert_eq!(store.calls().set, 3);
    assert_eq!(store.total(&id("789")), Some(whole(20)));
}

#[tokio::test]
async fn unavailable_store_escalates_at_ceiling() {
    let (store, r) = reconciler(ReconcilePolicy::Recompute, retry(10, 2));
    store.set_units_sold(&id("1"), 4);
    store.fail_always(StoreOp::UnitsSold, &id("1"), unavailable());

    let err = r.reconcile(&id("1"), ReconcileInput::Recompute).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert_eq!(store.calls().units_sold, 2, "ceiling, not max_attempts");
    assert_eq!(store.calls().set, 0);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let (store, r) = reconciler(ReconcilePolicy::Recompute, retry(5, 2));
    store.set_units_sold(&id("1"), 4);
    store.fail_always(
        StoreOp::Set,
        &id("1"),
        StoreError::Rejected {
            status: Some(422),
            message: "type mismatch".into(),
        },
    );
    let err = r.reconcile(&id("1"), ReconcileInput::Recompute).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permanent);
    assert_eq!(store.calls().set, 1);
}

fn event() -> Vec<u8> {
    json!({ "id": "o-1", "paymentStatus": "paid",
            "lineItems": [{ "entityId": "1", "quantity": 1 }, { "entityId": "2", "quantity": 2 }] })
    .to_string()
    .into_bytes()
}

fn outage_coordinator(redeliver: bool) -> (Arc<MemoryStore>, Coordinator) {
    let (store, r) = reconciler(ReconcilePolicy::Recompute, retry(2, 2));
    for e in ["1", "2"] {
        store.set_units_sold(&id(e), 1);
        store.fail_always(StoreOp::Set, &id(e), unavailable());
    }
    let settings = CoordinatorSettings {
        redeliver_on_total_outage: redeliver,
        ..CoordinatorSettings::default()
    };
    (store, Coordinator::new(Arc::new(r), settings))
}

#[tokio::test]
async fn total_outage_reported_in_body_by_default() {
    let (_store, c) = outage_coordinator(false);
    let r = c.handle(&event()).await.unwrap();
    assert_eq!(r.processed_count, 0);
    assert_eq!(r.failures.len(), 2);
    assert!(r
        .failures
        .iter()
        .all(|f| f.error_kind == ErrorKind::StoreUnavailable));
}

#[tokio::test]
async fn total_outage_requests_redelivery_when_enabled() {
    let (store, c) = outage_coordinator(true);
    let err = c.handle(&event()).await.unwrap_err();
    match err {
        IngestError::StoreUnavailable { event_id, failures } => {
            assert_eq!(event_id, "o-1");
            assert_eq!(failures.len(), 2);
        }
        other => panic!("expected StoreUnavailable, got {other:?}"),
    }

    // One entity recovering means the delivery is answered normally.
    store.clear_faults();
    store.fail_always(StoreOp::Set, &id("2"), unavailable());
    let r = c.handle(&event()).await.unwrap();
    assert_eq!(r.processed_count, 1);
    assert_eq!(r.failures.len(), 1);
}
