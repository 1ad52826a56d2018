//! Keyed per-entity mutual exclusion.
//!
//! A guard covers exactly one read+write pair. Entries whose mutex nobody
//! holds or waits on are removed when the last guard drops, so the table
//! stays proportional to in-flight entities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tally_schemas::EntityId;
use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct EntityLocks {
    table: Mutex<HashMap<EntityId, Slot>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, entity: &EntityId) -> EntityGuard<'_> {
        let slot = {
            let mut table = self.table();
            table
                .entry(entity.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        EntityGuard {
            locks: self,
            entity: entity.clone(),
            guard: Some(guard),
        }
    }

    /// Entities currently present in the table (held or awaited).
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<EntityId, Slot>> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct EntityGuard<'a> {
    locks: &'a EntityLocks,
    entity: EntityId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for EntityGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGuard")
            .field("entity", &self.entity)
            .finish()
    }
}

impl Drop for EntityGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.locks.table();
        // Only the table's own reference left: nobody holds or waits.
        let idle = table
            .get(&self.entity)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            table.remove(&self.entity);
        }
    }
}
