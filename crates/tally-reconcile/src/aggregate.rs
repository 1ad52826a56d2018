//! Line-Item Aggregator. Pure; no IO.

use std::collections::BTreeMap;

use serde::Serialize;
use tally_schemas::{EntityId, Micros};

use crate::ingress::PaymentEvent;

/// Contribution per unit sold. Never negative, so totals only grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rate(Micros);

impl Rate {
    pub fn new(per_unit: Micros) -> Result<Self, AggregateError> {
        if per_unit.is_negative() {
            return Err(AggregateError::NegativeRate { rate: per_unit });
        }
        Ok(Self(per_unit))
    }

    pub fn per_unit(self) -> Micros {
        self.0
    }

    /// `rate * units`, `None` on overflow.
    pub fn for_units(self, units: u64) -> Option<Micros> {
        self.0.checked_mul_units(units)
    }
}

/// One entity's share of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Contribution {
    pub units: u64,
    pub amount: Micros,
}

pub type Contributions = BTreeMap<EntityId, Contribution>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    NegativeRate { rate: Micros },
    QuantityOverflow { entity_id: EntityId },
    AmountOverflow { entity_id: EntityId, units: u64 },
}

impl std::fmt::Display for AggregateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateError::NegativeRate { rate } => {
                write!(f, "contribution rate must be non-negative, got {rate}")
            }
            AggregateError::QuantityOverflow { entity_id } => {
                write!(f, "summed quantity overflows for entity {entity_id}")
            }
            AggregateError::AmountOverflow { entity_id, units } => write!(
                f,
                "contribution overflows for entity {entity_id} ({units} units)"
            ),
        }
    }
}

impl std::error::Error for AggregateError {}

/// Result of grouping one event.
///
/// An entity whose quantities or amount overflow lands in `overflowed` and
/// is reported on its own; the other entities are unaffected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Aggregation {
    pub contributions: Contributions,
    pub overflowed: BTreeMap<EntityId, AggregateError>,
}

/// Group line items by entity and price each group at `rate`.
///
/// Untracked lines (no entity id) and entities whose quantities sum to zero
/// are left out.
pub fn aggregate(event: &PaymentEvent, rate: Rate) -> Aggregation {
    // `None` once the summed quantity has overflowed.
    let mut units: BTreeMap<EntityId, Option<u64>> = BTreeMap::new();
    for item in &event.line_items {
        let Some(entity_id) = &item.entity_id else {
            continue;
        };
        let slot = units.entry(entity_id.clone()).or_insert(Some(0));
        *slot = slot.and_then(|u| u.checked_add(item.quantity));
    }

    let mut out = Aggregation::default();
    for (entity_id, units) in units {
        let Some(units) = units else {
            let err = AggregateError::QuantityOverflow {
                entity_id: entity_id.clone(),
            };
            out.overflowed.insert(entity_id, err);
            continue;
        };
        if units == 0 {
            continue;
        }
        match rate.for_units(units) {
            Some(amount) => {
                out.contributions
                    .insert(entity_id, Contribution { units, amount });
            }
            None => {
                let err = AggregateError::AmountOverflow {
                    entity_id: entity_id.clone(),
                    units,
                };
                out.overflowed.insert(entity_id, err);
            }
        }
    }
    out
}
