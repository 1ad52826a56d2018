//! Request and response types for tally-daemon HTTP endpoints.
//!
//! No business logic lives here.

use serde::Serialize;
use tally_reconcile::{BatchResult, EntityFailure};
use tally_schemas::{EntityId, Micros};

// ---------------------------------------------------------------------------
// /api/webhooks/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// /api/webhooks/orders/paid
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAccepted {
    pub delivery_id: String,
    #[serde(flatten)]
    pub result: BatchResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable classification, e.g. `missing_field`, `store_unavailable`.
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<EntityFailure>,
}

impl ErrorResponse {
    pub fn new(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: kind.into(),
            field: None,
            delivery_id: None,
            failures: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// /api/totals/:entity_id
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TotalResponse {
    pub entity_id: EntityId,
    /// `null` when the attribute has never been written.
    pub total: Option<Micros>,
}
