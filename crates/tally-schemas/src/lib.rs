//! tally-schemas
//!
//! Shared leaf types for the contribution-total workspace:
//! - [`Micros`] fixed-point money (rate, contribution, stored totals)
//! - [`EntityId`] and [`AttributeRef`] addressing for the external store
//! - raw inbound payment-event wire shapes (`wire` module)
//!
//! No IO. No business rules beyond value construction.

mod entity;
mod money;
pub mod wire;

pub use entity::{AttributeRef, EntityId, EntityIdError};
pub use money::{DecimalError, Micros, MICROS_SCALE};
