//! Event Ingress.
//!
//! Turns raw webhook bytes into a validated [`PaymentEvent`], or a
//! [`Ingress::Skipped`] result for events that are well-formed but not
//! payable. Structural problems are [`MalformedEventError`]s: caller errors,
//! never retried.

use serde::Serialize;
use serde_json::{Map, Value};
use tally_schemas::wire::{RawPaymentEvent, KNOWN_EVENT_FIELDS, KNOWN_LINE_ITEM_FIELDS};
use tally_schemas::{EntityId, Micros};
use tracing::debug;

/// Validation knobs sourced from the `ingress` config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRules {
    /// Exact payment status that makes an event payable.
    pub paid_status: String,
    pub reject_unknown_fields: bool,
}

impl Default for IngressRules {
    fn default() -> Self {
        Self {
            paid_status: "paid".to_string(),
            reject_unknown_fields: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItem {
    /// `None` for untracked lines (custom items, tips).
    pub entity_id: Option<EntityId>,
    pub quantity: u64,
    /// Informational only; contributions use the configured rate. `None`
    /// when absent or not representable at micro precision.
    pub unit_price: Option<Micros>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    pub id: String,
    pub payment_status: String,
    pub line_items: Vec<LineItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// `status` is `None` when the event carried no payment status at all.
    NotPayable { status: Option<String> },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NotPayable { status: Some(s) } => {
                write!(f, "payment status '{s}' is not payable")
            }
            SkipReason::NotPayable { status: None } => write!(f, "payment status missing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingress {
    Accepted(PaymentEvent),
    Skipped { event_id: String, reason: SkipReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedKind {
    InvalidJson,
    NotAnObject,
    MissingField,
    InvalidField,
    UnknownField,
}

impl MalformedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MalformedKind::InvalidJson => "invalid_json",
            MalformedKind::NotAnObject => "not_an_object",
            MalformedKind::MissingField => "missing_field",
            MalformedKind::InvalidField => "invalid_field",
            MalformedKind::UnknownField => "unknown_field",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedEventError {
    pub kind: MalformedKind,
    /// Path of the offending field, e.g. `lineItems[2].quantity`.
    pub field: Option<String>,
    pub detail: String,
}

impl MalformedEventError {
    fn new(kind: MalformedKind, field: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            field,
            detail: detail.into(),
        }
    }

    fn at(kind: MalformedKind, field: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(kind, Some(field.into()), detail)
    }
}

impl std::fmt::Display for MalformedEventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(
                f,
                "malformed event ({}) at {}: {}",
                self.kind.as_str(),
                field,
                self.detail
            ),
            None => write!(f, "malformed event ({}): {}", self.kind.as_str(), self.detail),
        }
    }
}

impl std::error::Error for MalformedEventError {}

pub fn parse_event(bytes: &[u8], rules: &IngressRules) -> Result<Ingress, MalformedEventError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| MalformedEventError::new(MalformedKind::InvalidJson, None, e.to_string()))?;
    parse_event_value(value, rules)
}

pub fn parse_event_value(value: Value, rules: &IngressRules) -> Result<Ingress, MalformedEventError> {
    let obj = value.as_object().ok_or_else(|| {
        MalformedEventError::new(
            MalformedKind::NotAnObject,
            None,
            format!("expected a JSON object, got {}", json_type(&value)),
        )
    })?;

    if rules.reject_unknown_fields {
        reject_unknown(obj, KNOWN_EVENT_FIELDS, "")?;
    }

    match obj.get("id") {
        None | Some(Value::Null) => {
            return Err(MalformedEventError::at(
                MalformedKind::MissingField,
                "id",
                "event identifier is required",
            ))
        }
        Some(Value::String(_)) | Some(Value::Number(_)) => {}
        Some(other) => {
            return Err(MalformedEventError::at(
                MalformedKind::InvalidField,
                "id",
                format!("expected string or integer, got {}", json_type(other)),
            ))
        }
    }

    let items = match obj.get("lineItems").or_else(|| obj.get("line_items")) {
        None | Some(Value::Null) => {
            return Err(MalformedEventError::at(
                MalformedKind::MissingField,
                "lineItems",
                "line item array is required",
            ))
        }
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(MalformedEventError::at(
                MalformedKind::InvalidField,
                "lineItems",
                format!("expected array, got {}", json_type(other)),
            ))
        }
    };

    for (i, item) in items.iter().enumerate() {
        let item_obj = item.as_object().ok_or_else(|| {
            MalformedEventError::at(
                MalformedKind::InvalidField,
                format!("lineItems[{i}]"),
                format!("expected object, got {}", json_type(item)),
            )
        })?;
        if rules.reject_unknown_fields {
            reject_unknown(item_obj, KNOWN_LINE_ITEM_FIELDS, &format!("lineItems[{i}]."))?;
        }
        let price = item_obj.get("unitPrice").or_else(|| item_obj.get("price"));
        if let Some(p @ (Value::Bool(_) | Value::Array(_) | Value::Object(_))) = price {
            return Err(MalformedEventError::at(
                MalformedKind::InvalidField,
                format!("lineItems[{i}].unitPrice"),
                format!("expected string or number, got {}", json_type(p)),
            ));
        }
    }

    let raw: RawPaymentEvent = serde_json::from_value(value)
        .map_err(|e| MalformedEventError::new(MalformedKind::InvalidField, None, e.to_string()))?;

    let event_id = raw.id.to_text();
    if event_id.is_empty() {
        return Err(MalformedEventError::at(
            MalformedKind::InvalidField,
            "id",
            "event identifier is empty",
        ));
    }

    let mut line_items = Vec::with_capacity(raw.line_items.len());
    for (i, item) in raw.line_items.into_iter().enumerate() {
        let entity_id = match item.entity_id {
            None => None,
            Some(rid) => Some(EntityId::new(rid.to_text()).map_err(|e| {
                MalformedEventError::at(
                    MalformedKind::InvalidField,
                    format!("lineItems[{i}].entityId"),
                    e.to_string(),
                )
            })?),
        };

        let quantity = match item.quantity {
            None => 0,
            Some(q) => u64::try_from(q).map_err(|_| {
                MalformedEventError::at(
                    MalformedKind::InvalidField,
                    format!("lineItems[{i}].quantity"),
                    format!("quantity must be non-negative, got {q}"),
                )
            })?,
        };

        let unit_price = item.unit_price.and_then(|p| {
            let text = p.as_text();
            Micros::parse_decimal(&text)
                .map_err(|e| debug!(line = i, price = %text, error = %e, "unit price dropped"))
                .ok()
        });

        line_items.push(LineItem {
            entity_id,
            quantity,
            unit_price,
        });
    }

    let status = raw.payment_status;
    if status.as_deref() != Some(rules.paid_status.as_str()) {
        return Ok(Ingress::Skipped {
            event_id,
            reason: SkipReason::NotPayable { status },
        });
    }

    Ok(Ingress::Accepted(PaymentEvent {
        id: event_id,
        payment_status: rules.paid_status.clone(),
        line_items,
    }))
}

fn reject_unknown(
    obj: &Map<String, Value>,
    known: &[&str],
    prefix: &str,
) -> Result<(), MalformedEventError> {
    // Map iteration is key-sorted, so the first reported key is stable.
    match obj.keys().find(|k| !known.contains(&k.as_str())) {
        Some(k) => Err(MalformedEventError::at(
            MalformedKind::UnknownField,
            format!("{prefix}{k}"),
            "field is not recognised",
        )),
        None => Ok(()),
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
