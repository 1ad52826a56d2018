//! tally-store
//!
//! External State Store Adapter boundary.
//!
//! The store is a black box with its own consistency model (single-writer
//! last-wins per field, no cross-entity transactions). This crate exposes it
//! through two object-safe traits and never retries internally; retry policy
//! belongs to the reconciler.
//!
//! Backends:
//! - [`ShopifyAdminStore`]: Admin GraphQL API (product metafields)
//! - [`MemoryStore`]: in-process, with fault injection

mod error;
mod memory;
mod shopify;

pub use error::{FailureClass, StoreError};
pub use memory::{CallCounts, MemoryStore, StoreOp};
pub use shopify::{ShopifyAdminStore, ShopifyStoreConfig};

use tally_schemas::{AttributeRef, EntityId, Micros};

/// Read/write access to one named numeric attribute per entity.
///
/// Implementations are scoped to a single [`AttributeRef`] chosen at
/// construction and must be `Send + Sync` so one instance can serve many
/// concurrent entity jobs.
#[async_trait::async_trait]
pub trait AttributeStore: Send + Sync {
    /// Human-readable backend name (e.g. `"shopify"`).
    fn name(&self) -> &'static str;

    /// The attribute this store reads and writes.
    fn attribute(&self) -> &AttributeRef;

    /// Current stored value, or `None` if the attribute was never written.
    async fn get(&self, entity: &EntityId) -> Result<Option<Micros>, StoreError>;

    /// Overwrite the stored value.
    async fn set(&self, entity: &EntityId, value: Micros) -> Result<(), StoreError>;
}

/// Authoritative upstream counter of lifetime units sold per entity.
///
/// Owned and maintained by the external platform, never by this workspace.
#[async_trait::async_trait]
pub trait UnitsSoldSource: Send + Sync {
    /// `None` when the platform holds no counter for this entity.
    async fn units_sold(&self, entity: &EntityId) -> Result<Option<u64>, StoreError>;
}
