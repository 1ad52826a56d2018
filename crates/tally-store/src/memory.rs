//! In-process attribute store.
//!
//! Used by the `memory` backend and by tests. Supports scripted faults per
//! (operation, entity) and an optional per-call latency so concurrency tests
//! can widen the window between a read and its write.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tally_schemas::{AttributeRef, EntityId, Micros};

use crate::{AttributeStore, StoreError, UnitsSoldSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Set,
    UnitsSold,
}

/// Number of calls observed per operation, faulted calls included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: u64,
    pub set: u64,
    pub units_sold: u64,
}

#[derive(Debug, Default)]
struct Faults {
    /// Consumed front to back, one per call.
    queued: VecDeque<StoreError>,
    always: Option<StoreError>,
}

#[derive(Debug, Default)]
struct Inner {
    totals: HashMap<EntityId, Micros>,
    units_sold: HashMap<EntityId, u64>,
    faults: HashMap<(StoreOp, EntityId), Faults>,
    calls: CallCounts,
    latency: Duration,
}

#[derive(Debug)]
pub struct MemoryStore {
    attribute: AttributeRef,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(attribute: AttributeRef) -> Self {
        Self {
            attribute,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_total(self, entity: &EntityId, value: Micros) -> Self {
        self.seed_total(entity, value);
        self
    }

    pub fn seed_total(&self, entity: &EntityId, value: Micros) {
        self.lock().totals.insert(entity.clone(), value);
    }

    /// Peek at the stored value without counting a call or hitting faults.
    pub fn total(&self, entity: &EntityId) -> Option<Micros> {
        self.lock().totals.get(entity).copied()
    }

    pub fn set_units_sold(&self, entity: &EntityId, units: u64) {
        self.lock().units_sold.insert(entity.clone(), units);
    }

    /// Bump the upstream counter the way the platform would on a sale.
    pub fn record_sale(&self, entity: &EntityId, units: u64) {
        let mut inner = self.lock();
        let slot = inner.units_sold.entry(entity.clone()).or_insert(0);
        *slot = slot.saturating_add(units);
    }

    /// Fail the next call of `op` for `entity` with `err`. Repeated calls queue.
    pub fn fail_next(&self, op: StoreOp, entity: &EntityId, err: StoreError) {
        self.lock()
            .faults
            .entry((op, entity.clone()))
            .or_default()
            .queued
            .push_back(err);
    }

    /// Fail every call of `op` for `entity` until [`clear_faults`](Self::clear_faults).
    pub fn fail_always(&self, op: StoreOp, entity: &EntityId, err: StoreError) {
        self.lock()
            .faults
            .entry((op, entity.clone()))
            .or_default()
            .always = Some(err);
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicked test thread must not wedge the others.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Count the call and return the latency to apply plus any scripted fault.
    fn enter(&self, op: StoreOp, entity: &EntityId) -> (Duration, Option<StoreError>) {
        let mut inner = self.lock();
        match op {
            StoreOp::Get => inner.calls.get += 1,
            StoreOp::Set => inner.calls.set += 1,
            StoreOp::UnitsSold => inner.calls.units_sold += 1,
        }
        let latency = inner.latency;
        let fault = inner
            .faults
            .get_mut(&(op, entity.clone()))
            .and_then(|f| f.queued.pop_front().or_else(|| f.always.clone()));
        (latency, fault)
    }
}

async fn pause(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

#[async_trait::async_trait]
impl AttributeStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn attribute(&self) -> &AttributeRef {
        &self.attribute
    }

    async fn get(&self, entity: &EntityId) -> Result<Option<Micros>, StoreError> {
        let (latency, fault) = self.enter(StoreOp::Get, entity);
        pause(latency).await;
        if let Some(err) = fault {
            return Err(err);
        }
        Ok(self.total(entity))
    }

    async fn set(&self, entity: &EntityId, value: Micros) -> Result<(), StoreError> {
        let (latency, fault) = self.enter(StoreOp::Set, entity);
        pause(latency).await;
        if let Some(err) = fault {
            return Err(err);
        }
        self.seed_total(entity, value);
        Ok(())
    }
}

#[async_trait::async_trait]
impl UnitsSoldSource for MemoryStore {
    async fn units_sold(&self, entity: &EntityId) -> Result<Option<u64>, StoreError> {
        let (latency, fault) = self.enter(StoreOp::UnitsSold, entity);
        pause(latency).await;
        if let Some(err) = fault {
            return Err(err);
        }
        Ok(self.lock().units_sold.get(entity).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(AttributeRef::new("ns", "total"))
    }

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    #[tokio::test]
    async fn unset_attribute_reads_none() {
        let s = store();
        assert_eq!(s.get(&id("1")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get() {
        let s = store();
        s.set(&id("1"), Micros::new(35_000_000)).await.unwrap();
        assert_eq!(s.get(&id("1")).await.unwrap(), Some(Micros::new(35_000_000)));
        assert_eq!(s.calls(), CallCounts { get: 1, set: 1, units_sold: 0 });
    }

    #[tokio::test]
    async fn failed_set_leaves_value_unchanged() {
        let s = store().with_total(&id("1"), Micros::new(10));
        s.fail_next(StoreOp::Set, &id("1"), StoreError::Transport("reset".into()));
        assert!(s.set(&id("1"), Micros::new(99)).await.is_err());
        assert_eq!(s.total(&id("1")), Some(Micros::new(10)));
        s.set(&id("1"), Micros::new(99)).await.unwrap();
        assert_eq!(s.total(&id("1")), Some(Micros::new(99)));
    }

    #[tokio::test]
    async fn faults_are_scoped_to_entity() {
        let s = store();
        s.fail_always(
            StoreOp::Get,
            &id("1"),
            StoreError::Unavailable { status: Some(503), message: "down".into() },
        );
        assert!(s.get(&id("1")).await.is_err());
        assert!(s.get(&id("1")).await.is_err());
        assert!(s.get(&id("2")).await.is_ok());
        s.clear_faults();
        assert!(s.get(&id("1")).await.is_ok());
    }

    #[tokio::test]
    async fn units_sold_counter() {
        let s = store();
        assert_eq!(s.units_sold(&id("7")).await.unwrap(), None);
        s.record_sale(&id("7"), 25);
        s.record_sale(&id("7"), 10);
        assert_eq!(s.units_sold(&id("7")).await.unwrap(), Some(35));
    }
}
