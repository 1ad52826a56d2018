//! Shared runtime state for tally-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The engine is reached
//! through the [`EventHandler`] trait for webhook ingestion and through the
//! [`Reconciler`] for lookups and manual recomputes.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_reconcile::{BatchResult, Coordinator, EventHandler, Reconciler};
use tally_schemas::{EntityId, Micros};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// BusMsg: SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat {
        ts_millis: i64,
    },
    TotalUpdated {
        entity_id: EntityId,
        total: Micros,
        /// `None` for manual recomputes.
        event_id: Option<String>,
    },
    BatchCompleted {
        event_id: String,
        delivery_id: String,
        processed_count: usize,
        skipped_count: usize,
        failure_count: usize,
    },
}

impl BusMsg {
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::TotalUpdated { .. } => "total_updated",
            BusMsg::BatchCompleted { .. } => "batch_completed",
        }
    }
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    pub build: BuildInfo,
    pub handler: Arc<dyn EventHandler>,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let reconciler = Arc::clone(coordinator.reconciler());
        Self::with_handler(coordinator, reconciler)
    }

    /// Route webhooks to an arbitrary handler (tests substitute stubs here).
    pub fn with_handler(handler: Arc<dyn EventHandler>, reconciler: Arc<Reconciler>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            bus,
            build: BuildInfo {
                service: "tally-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            handler,
            reconciler,
        }
    }

    /// Fan a finished batch out to SSE subscribers. No-op without subscribers.
    pub fn publish_batch(&self, delivery_id: &str, result: &BatchResult) {
        for t in &result.totals {
            let _ = self.bus.send(BusMsg::TotalUpdated {
                entity_id: t.entity_id.clone(),
                total: t.new_total,
                event_id: Some(result.event_id.clone()),
            });
        }
        let _ = self.bus.send(BusMsg::BatchCompleted {
            event_id: result.event_id.clone(),
            delivery_id: delivery_id.to_string(),
            processed_count: result.processed_count,
            skipped_count: result.skipped_count,
            failure_count: result.failures.len(),
        });
    }
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
