//! Bounded `(event_id, entity_id)` dedupe window for the incremental policy.
//!
//! A pair is claimed before its job runs and committed only after the write
//! is known to have landed. Dropping an uncommitted claim releases it. A
//! concurrent delivery of an in-flight pair waits for that claim to resolve
//! and then looks again: committed means duplicate, released means it takes
//! the claim and runs the job itself.
//!
//! The window is in-memory: it does not survive restarts and remembers at
//! most `capacity` committed pairs (oldest evicted first).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use tally_schemas::EntityId;
use tokio::sync::watch;

type Key = (String, EntityId);

#[derive(Debug, Default)]
struct Window {
    committed: HashSet<Key>,
    order: VecDeque<Key>,
    /// Closed when the owning claim commits or is dropped.
    in_flight: HashMap<Key, watch::Receiver<()>>,
}

#[derive(Debug)]
pub struct EventDedupe {
    capacity: usize,
    window: Mutex<Window>,
}

/// Outcome of a non-blocking claim attempt.
#[derive(Debug)]
pub enum Claim<'a> {
    Claimed(DedupeClaim<'a>),
    /// Already applied.
    Duplicate,
    /// Another delivery holds the claim; resolves when the receiver closes.
    InFlight(watch::Receiver<()>),
}

impl EventDedupe {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            window: Mutex::new(Window::default()),
        }
    }

    pub fn try_claim(&self, event_id: &str, entity_id: &EntityId) -> Claim<'_> {
        let key = (event_id.to_string(), entity_id.clone());
        let mut w = self.window();
        if w.committed.contains(&key) {
            return Claim::Duplicate;
        }
        if let Some(rx) = w.in_flight.get(&key) {
            return Claim::InFlight(rx.clone());
        }
        let (tx, rx) = watch::channel(());
        w.in_flight.insert(key.clone(), rx);
        Claim::Claimed(DedupeClaim {
            dedupe: self,
            key: Some(key),
            _done: tx,
        })
    }

    /// Claim the pair, waiting out any in-flight holder. `None` when the
    /// pair has been applied.
    pub async fn claim(&self, event_id: &str, entity_id: &EntityId) -> Option<DedupeClaim<'_>> {
        loop {
            match self.try_claim(event_id, entity_id) {
                Claim::Claimed(claim) => return Some(claim),
                Claim::Duplicate => return None,
                Claim::InFlight(mut rx) => {
                    // Err once the holder's sender is dropped; no value is ever sent.
                    let _ = rx.changed().await;
                }
            }
        }
    }

    pub fn contains(&self, event_id: &str, entity_id: &EntityId) -> bool {
        self.window()
            .committed
            .contains(&(event_id.to_string(), entity_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.window().committed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn window(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn commit(&self, key: Key) {
        let mut w = self.window();
        w.in_flight.remove(&key);
        if w.committed.insert(key.clone()) {
            w.order.push_back(key);
        }
        while w.order.len() > self.capacity {
            if let Some(old) = w.order.pop_front() {
                w.committed.remove(&old);
            }
        }
    }

    fn release(&self, key: &Key) {
        self.window().in_flight.remove(key);
    }
}

/// An in-flight claim on one `(event_id, entity_id)` pair.
#[derive(Debug)]
pub struct DedupeClaim<'a> {
    dedupe: &'a EventDedupe,
    key: Option<Key>,
    // Dropped after the window is updated, waking waiters.
    _done: watch::Sender<()>,
}

impl DedupeClaim<'_> {
    /// Mark the pair as applied.
    pub fn commit(mut self) {
        if let Some(key) = self.key.take() {
            self.dedupe.commit(key);
        }
    }
}

impl Drop for DedupeClaim<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.dedupe.release(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    fn claimed<'a>(c: Claim<'a>) -> DedupeClaim<'a> {
        match c {
            Claim::Claimed(claim) => claim,
            other => panic!("expected a fresh claim, got {other:?}"),
        }
    }

    #[test]
    fn committed_pair_is_a_duplicate() {
        let d = EventDedupe::new(16);
        claimed(d.try_claim("e1", &id("1"))).commit();
        assert!(d.contains("e1", &id("1")));
        assert!(matches!(d.try_claim("e1", &id("1")), Claim::Duplicate));
        // Same event, other entity: independent.
        assert!(matches!(d.try_claim("e1", &id("2")), Claim::Claimed(_)));
    }

    #[test]
    fn dropped_claim_is_released() {
        let d = EventDedupe::new(16);
        {
            let _claim = claimed(d.try_claim("e1", &id("1")));
            assert!(matches!(d.try_claim("e1", &id("1")), Claim::InFlight(_)));
        }
        assert!(!d.contains("e1", &id("1")));
        assert!(matches!(d.try_claim("e1", &id("1")), Claim::Claimed(_)));
    }

    #[test]
    fn oldest_pairs_are_evicted() {
        let d = EventDedupe::new(2);
        for ev in ["a", "b", "c"] {
            claimed(d.try_claim(ev, &id("1"))).commit();
        }
        assert_eq!(d.len(), 2);
        assert!(!d.contains("a", &id("1")));
        assert!(d.contains("c", &id("1")));
    }

    #[tokio::test]
    async fn waiter_sees_commit_as_duplicate() {
        let d = EventDedupe::new(16);
        let first = claimed(d.try_claim("e1", &id("1")));
        let id1 = id("1");
        let (waited, ()) = tokio::join!(d.claim("e1", &id1), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            first.commit();
        });
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn waiter_takes_over_a_released_claim() {
        let d = EventDedupe::new(16);
        let first = claimed(d.try_claim("e1", &id("1")));
        let id1 = id("1");
        let (waited, ()) = tokio::join!(d.claim("e1", &id1), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(first);
        });
        let claim = waited.expect("released pair can be claimed again");
        claim.commit();
        assert!(d.contains("e1", &id("1")));
    }
}
