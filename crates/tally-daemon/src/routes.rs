//! Axum router and all HTTP handlers for tally-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. Handlers are `pub(crate)`; scenario tests in `tests/`
//! compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tally_reconcile::{FailureCause, IngestError, ReconcileError};
use tally_schemas::EntityId;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api_types::{ErrorResponse, HealthResponse, TotalResponse, WebhookAccepted},
    state::{AppState, BusMsg},
};

/// Header the commerce platform uses to identify one delivery attempt.
pub const DELIVERY_ID_HEADER: &str = "x-shopify-webhook-id";

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/webhooks/orders/paid", post(orders_paid))
        .route("/api/webhooks/health", get(health))
        .route("/api/totals/:entity_id", get(total_lookup))
        .route("/api/totals/:entity_id/recompute", post(total_recompute))
        .route("/api/stream", get(stream))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /api/webhooks/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy",
            service: st.build.service,
            version: st.build.version,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /api/webhooks/orders/paid
// ---------------------------------------------------------------------------

/// Ingest one payment event.
///
/// - 200: ingested, including skipped events and per-entity failures.
/// - 400: structurally malformed payload (never worth redelivering).
/// - 500: every entity failed retryably and redelivery is enabled.
pub(crate) async fn orders_paid(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let delivery_id = headers
        .get(DELIVERY_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match st.handler.handle(&body).await {
        Ok(result) => {
            info!(
                delivery_id = %delivery_id,
                event_id = %result.event_id,
                processed = result.processed_count,
                skipped = result.skipped_count,
                failed = result.failures.len(),
                "webhook ingested"
            );
            st.publish_batch(&delivery_id, &result);
            (
                StatusCode::OK,
                Json(WebhookAccepted {
                    delivery_id,
                    result,
                }),
            )
                .into_response()
        }
        Err(IngestError::Malformed(e)) => {
            warn!(delivery_id = %delivery_id, error = %e, "malformed webhook payload");
            let mut body = ErrorResponse::new(e.kind.as_str(), e.to_string());
            body.field = e.field.clone();
            body.delivery_id = Some(delivery_id);
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
        Err(err @ IngestError::StoreUnavailable { .. }) => {
            warn!(delivery_id = %delivery_id, error = %err, "store outage, asking for redelivery");
            let mut body = ErrorResponse::new("store_unavailable", err.to_string());
            body.delivery_id = Some(delivery_id);
            if let IngestError::StoreUnavailable { failures, .. } = err {
                body.failures = failures;
            }
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /api/totals/:entity_id
// ---------------------------------------------------------------------------

pub(crate) async fn total_lookup(
    State(st): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Response {
    let entity_id = match EntityId::new(&raw) {
        Ok(id) => id,
        Err(e) => return bad_entity(e),
    };
    match st.reconciler.current_total(&entity_id).await {
        Ok(total) => (StatusCode::OK, Json(TotalResponse { entity_id, total })).into_response(),
        Err(e) => reconcile_error_response(&e),
    }
}

// ---------------------------------------------------------------------------
// POST /api/totals/:entity_id/recompute
// ---------------------------------------------------------------------------

pub(crate) async fn total_recompute(
    State(st): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Response {
    let entity_id = match EntityId::new(&raw) {
        Ok(id) => id,
        Err(e) => return bad_entity(e),
    };
    match st.reconciler.recompute(&entity_id).await {
        Ok(total) => {
            info!(entity_id = %entity_id, total = %total, "manual recompute");
            let _ = st.bus.send(BusMsg::TotalUpdated {
                entity_id: entity_id.clone(),
                total,
                event_id: None,
            });
            (
                StatusCode::OK,
                Json(TotalResponse {
                    entity_id,
                    total: Some(total),
                }),
            )
                .into_response()
        }
        Err(e) => reconcile_error_response(&e),
    }
}

fn bad_entity(e: tally_schemas::EntityIdError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse::new("invalid_entity_id", e.to_string())),
    )
        .into_response()
}

/// 409 when there is nothing to recompute from, 502 for store failures.
fn reconcile_error_response(e: &ReconcileError) -> Response {
    let status = match e {
        ReconcileError::Permanent {
            source: FailureCause::NoUnitsSoldSource | FailureCause::UnitsSoldMissing,
            ..
        } => StatusCode::CONFLICT,
        _ => StatusCode::BAD_GATEWAY,
    };
    warn!(entity_id = %e.entity_id(), status = status.as_u16(), error = %e, "totals request failed");
    (status, Json(ErrorResponse::new(e.kind().as_str(), e.to_string()))).into_response()
}

// ---------------------------------------------------------------------------
// GET /api/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
