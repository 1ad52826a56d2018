//! Reconciliation Coordinator.
//!
//! Drives one delivery through ingress, aggregation and one reconcile job per
//! distinct entity. Jobs run concurrently up to `max_parallel_entities`; an
//! entity's failure is recorded in the [`BatchResult`] and never cancels the
//! others.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tally_schemas::{EntityId, Micros};
use tracing::{info, warn};

use crate::aggregate::{aggregate, Contribution, Rate};
use crate::dedupe::EventDedupe;
use crate::ingress::{parse_event, Ingress, IngressRules, MalformedEventError, SkipReason};
use crate::reconciler::{ErrorKind, ReconcilePolicy, Reconciler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    pub rules: IngressRules,
    pub max_parallel_entities: usize,
    pub dedupe_capacity: usize,
    /// Answer a delivery whose every job failed retryably with an error so
    /// the platform redelivers it.
    pub redeliver_on_total_outage: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            rules: IngressRules::default(),
            max_parallel_entities: 8,
            dedupe_capacity: 10_000,
            redeliver_on_total_outage: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchStatus {
    Processed,
    Skipped { reason: SkipReason },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub entity_id: EntityId,
    pub error_kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityTotal {
    pub entity_id: EntityId,
    pub units: u64,
    pub contribution: Micros,
    pub new_total: Micros,
}

/// Per-delivery outcome. `failures` and `totals` are sorted by entity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub event_id: String,
    pub status: BatchStatus,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub failures: Vec<EntityFailure>,
    pub totals: Vec<EntityTotal>,
}

impl BatchResult {
    fn skipped(event_id: String, reason: SkipReason) -> Self {
        Self {
            event_id,
            status: BatchStatus::Skipped { reason },
            processed_count: 0,
            skipped_count: 0,
            failures: Vec::new(),
            totals: Vec::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, BatchStatus::Skipped { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    Malformed(MalformedEventError),
    /// Every job failed with a retryable kind; the delivery should be retried.
    StoreUnavailable {
        event_id: String,
        failures: Vec<EntityFailure>,
    },
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Malformed(e) => write!(f, "{e}"),
            IngestError::StoreUnavailable { event_id, failures } => write!(
                f,
                "event {event_id}: store unavailable for all {} entities",
                failures.len()
            ),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<MalformedEventError> for IngestError {
    fn from(e: MalformedEventError) -> Self {
        IngestError::Malformed(e)
    }
}

/// Typed entry point the routing layer calls with a raw request body.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> Result<BatchResult, IngestError>;
}

#[derive(Debug)]
pub struct Coordinator {
    reconciler: Arc<Reconciler>,
    settings: CoordinatorSettings,
    dedupe: Option<EventDedupe>,
}

enum JobOutcome {
    Written(EntityTotal),
    Duplicate,
    Failed(EntityFailure),
}

impl Coordinator {
    pub fn new(reconciler: Arc<Reconciler>, settings: CoordinatorSettings) -> Self {
        let dedupe = match reconciler.policy() {
            ReconcilePolicy::Incremental => Some(EventDedupe::new(settings.dedupe_capacity)),
            ReconcilePolicy::Recompute => None,
        };
        Self {
            reconciler,
            settings,
            dedupe,
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn rate(&self) -> Rate {
        self.reconciler.rate()
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub async fn handle(&self, body: &[u8]) -> Result<BatchResult, IngestError> {
        let event = match parse_event(body, &self.settings.rules)? {
            Ingress::Skipped { event_id, reason } => {
                info!(event_id = %event_id, reason = %reason, "event skipped");
                return Ok(BatchResult::skipped(event_id, reason));
            }
            Ingress::Accepted(event) => event,
        };

        let aggregation = aggregate(&event, self.reconciler.rate());
        info!(
            event_id = %event.id,
            entities = aggregation.contributions.len() + aggregation.overflowed.len(),
            policy = ?self.reconciler.policy(),
            "event accepted"
        );

        let event_id = event.id.as_str();
        let outcomes: Vec<JobOutcome> = stream::iter(aggregation.contributions)
            .map(|(entity_id, contribution)| self.run_entity(event_id, entity_id, contribution))
            .buffer_unordered(self.settings.max_parallel_entities.max(1))
            .collect()
            .await;

        let mut result = BatchResult {
            event_id: event.id.clone(),
            status: BatchStatus::Processed,
            processed_count: 0,
            skipped_count: 0,
            failures: Vec::new(),
            totals: Vec::new(),
        };
        for (entity_id, err) in aggregation.overflowed {
            warn!(event_id, entity_id = %entity_id, error = %err, "entity contribution overflows");
            result.failures.push(EntityFailure {
                entity_id,
                error_kind: ErrorKind::Permanent,
                message: err.to_string(),
            });
        }
        for outcome in outcomes {
            match outcome {
                JobOutcome::Written(t) => {
                    result.processed_count += 1;
                    result.totals.push(t);
                }
                JobOutcome::Duplicate => result.skipped_count += 1,
                JobOutcome::Failed(f) => result.failures.push(f),
            }
        }
        result.totals.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        result.failures.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        let total_outage = result.totals.is_empty()
            && !result.failures.is_empty()
            && result.failures.iter().all(|f| f.error_kind.is_retryable());
        if total_outage && self.settings.redeliver_on_total_outage {
            warn!(
                event_id = %result.event_id,
                failures = result.failures.len(),
                "no entity reconciled, requesting redelivery"
            );
            return Err(IngestError::StoreUnavailable {
                event_id: result.event_id,
                failures: result.failures,
            });
        }

        info!(
            event_id = %result.event_id,
            processed = result.processed_count,
            skipped = result.skipped_count,
            failed = result.failures.len(),
            "event reconciled"
        );
        Ok(result)
    }

    async fn run_entity(
        &self,
        event_id: &str,
        entity_id: EntityId,
        contribution: Contribution,
    ) -> JobOutcome {
        let claim = match &self.dedupe {
            Some(dedupe) => match dedupe.claim(event_id, &entity_id).await {
                Some(claim) => Some(claim),
                None => {
                    info!(event_id, entity_id = %entity_id, "duplicate delivery, entity skipped");
                    return JobOutcome::Duplicate;
                }
            },
            None => None,
        };

        let input = self.reconciler.input_for(contribution.amount);
        match self.reconciler.reconcile(&entity_id, input).await {
            Ok(new_total) => {
                if let Some(claim) = claim {
                    claim.commit();
                }
                JobOutcome::Written(EntityTotal {
                    entity_id,
                    units: contribution.units,
                    contribution: contribution.amount,
                    new_total,
                })
            }
            Err(err) => {
                // The write may have landed; a redelivery must not add it again.
                if err.is_write_outcome_unknown() {
                    if let Some(claim) = claim {
                        claim.commit();
                    }
                }
                warn!(
                    event_id,
                    entity_id = %entity_id,
                    kind = err.kind().as_str(),
                    error = %err,
                    "entity reconcile failed"
                );
                JobOutcome::Failed(EntityFailure {
                    entity_id,
                    error_kind: err.kind(),
                    message: err.to_string(),
                })
            }
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for Coordinator {
    async fn handle(&self, body: &[u8]) -> Result<BatchResult, IngestError> {
        Coordinator::handle(self, body).await
    }
}
