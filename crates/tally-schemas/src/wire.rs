//! Inbound payment-event wire shapes.
//!
//! These mirror the JSON body accepted by the webhook endpoint:
//!
//! ```json
//! { "id": 12345, "paymentStatus": "paid",
//!   "lineItems": [{ "entityId": 789, "quantity": 25, "unitPrice": "1.00" }] }
//! ```
//!
//! The commerce platform's native field names (`financial_status`,
//! `line_items`, `product_id`, `price`) are accepted as aliases so a raw
//! platform webhook can be posted unchanged. Validation beyond shape lives in
//! `tally-reconcile::ingress`.

use serde::{Deserialize, Serialize};

/// Top-level keys recognised on an event object (camel case plus aliases).
pub const KNOWN_EVENT_FIELDS: &[&str] = &[
    "id",
    "paymentStatus",
    "financial_status",
    "lineItems",
    "line_items",
];

/// Keys recognised on a line-item object (camel case plus aliases).
pub const KNOWN_LINE_ITEM_FIELDS: &[&str] = &["entityId", "product_id", "quantity", "unitPrice", "price"];

/// An identifier the platform may send either as a JSON string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    /// Canonical text form (`12345`, `"abc"` -> `abc`).
    pub fn to_text(&self) -> String {
        match self {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s.trim().to_string(),
        }
    }
}

/// A decimal the platform may send as a string (`"1.00"`) or a JSON number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawDecimal {
    Text(String),
    Number(serde_json::Number),
}

impl RawDecimal {
    pub fn as_text(&self) -> String {
        match self {
            RawDecimal::Text(s) => s.clone(),
            RawDecimal::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPaymentEvent {
    pub id: RawId,
    #[serde(alias = "financial_status", default)]
    pub payment_status: Option<String>,
    #[serde(alias = "line_items")]
    pub line_items: Vec<RawLineItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLineItem {
    /// `None` (absent or `null`) marks a line with no tracked entity, e.g. a
    /// custom line item or a tip.
    #[serde(alias = "product_id", default)]
    pub entity_id: Option<RawId>,
    /// Signed on the wire so negative values can be rejected explicitly
    /// rather than failing as a type mismatch.
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(alias = "price", default)]
    pub unit_price: Option<RawDecimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camel_case_payload_decodes() {
        let v = serde_json::json!({
            "id": "evt-1",
            "paymentStatus": "paid",
            "lineItems": [{ "entityId": "789", "quantity": 2, "unitPrice": 1.5 }]
        });
        let ev: RawPaymentEvent = serde_json::from_value(v).unwrap();
        assert_eq!(ev.id, RawId::Text("evt-1".to_string()));
        assert_eq!(ev.payment_status.as_deref(), Some("paid"));
        assert_eq!(ev.line_items[0].entity_id, Some(RawId::Text("789".to_string())));
        assert_eq!(ev.line_items[0].unit_price.as_ref().unwrap().as_text(), "1.5");
    }

    #[test]
    fn platform_native_payload_decodes() {
        let v = serde_json::json!({
            "id": 12345,
            "financial_status": "paid",
            "line_items": [
                { "product_id": 789, "quantity": 25, "price": "1.00" },
                { "product_id": null, "quantity": 1, "price": "5.00" }
            ]
        });
        let ev: RawPaymentEvent = serde_json::from_value(v).unwrap();
        assert_eq!(ev.id.to_text(), "12345");
        assert_eq!(ev.line_items[0].entity_id, Some(RawId::Number(789)));
        assert_eq!(ev.line_items[1].entity_id, None);
    }

    #[test]
    fn fractional_quantity_is_rejected() {
        let v = serde_json::json!({
            "id": 1,
            "lineItems": [{ "entityId": 1, "quantity": 2.5 }]
        });
        assert!(serde_json::from_value::<RawPaymentEvent>(v).is_err());
    }
}
