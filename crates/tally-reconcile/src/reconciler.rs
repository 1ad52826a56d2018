//! Total Reconciler.
//!
//! Computes and persists one entity's total. Two policies:
//!
//! - **Recompute** (default): `total = rate * units_sold(entity)` read from
//!   the platform's own counter. Convergent under redelivery, reordering and
//!   concurrent delivery.
//! - **Incremental**: `total = current + contribution`, read-modify-write
//!   under the entity lock. Not idempotent on its own; the coordinator pairs
//!   it with [`crate::EventDedupe`]. A write that fails at the transport
//!   level may still have landed, so it is never retried and is reported as
//!   [`FailureCause::WriteOutcomeUnknown`]; the stored total may then lag by
//!   that one contribution until an operator recompute.
//!
//! Retry lives here, not in the store adapter. Each attempt is one full
//! fetch/compute/write pass; the entity lock (when taken) is dropped before
//! the backoff sleep.

use std::sync::Arc;

use serde::Serialize;
use tally_schemas::{EntityId, Micros};
use tally_store::{AttributeStore, FailureClass, StoreError, UnitsSoldSource};
use tracing::{debug, info, warn};

use crate::aggregate::Rate;
use crate::job::{JobState, ReconcileJob, TransitionError};
use crate::lock::{EntityGuard, EntityLocks};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    #[default]
    Recompute,
    Incremental,
}

/// What a job needs in order to compute its new total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileInput {
    /// Add this amount to the stored total.
    Contribution(Micros),
    /// Derive the total from the units-sold counter.
    Recompute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    StoreUnavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::StoreUnavailable => "store_unavailable",
        }
    }

    /// Kinds that may clear up on redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::StoreUnavailable)
    }
}

/// Why a job failed permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    Store(StoreError),
    NoUnitsSoldSource,
    UnitsSoldMissing,
    Overflow { detail: String },
    IllegalTransition(TransitionError),
    /// An incremental write failed in transit and may or may not have landed.
    WriteOutcomeUnknown(StoreError),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Store(e) => write!(f, "{e}"),
            FailureCause::NoUnitsSoldSource => write!(f, "no units-sold source configured"),
            FailureCause::UnitsSoldMissing => {
                write!(f, "platform holds no units-sold counter for this entity")
            }
            FailureCause::Overflow { detail } => write!(f, "arithmetic overflow: {detail}"),
            FailureCause::IllegalTransition(e) => write!(f, "{e}"),
            FailureCause::WriteOutcomeUnknown(e) => {
                write!(f, "write outcome unknown, not retried: {e}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Network or rate-limit failures outlasted the retry budget.
    Transient {
        entity_id: EntityId,
        attempts: u32,
        source: StoreError,
    },
    Permanent {
        entity_id: EntityId,
        source: FailureCause,
    },
    /// The store stayed unavailable past the configured ceiling.
    StoreUnavailable {
        entity_id: EntityId,
        attempts: u32,
        source: StoreError,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::Transient { .. } => ErrorKind::Transient,
            ReconcileError::Permanent { .. } => ErrorKind::Permanent,
            ReconcileError::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            ReconcileError::Transient { entity_id, .. }
            | ReconcileError::Permanent { entity_id, .. }
            | ReconcileError::StoreUnavailable { entity_id, .. } => entity_id,
        }
    }

    pub fn is_missing_source(&self) -> bool {
        matches!(
            self,
            ReconcileError::Permanent {
                source: FailureCause::NoUnitsSoldSource,
                ..
            }
        )
    }

    pub fn is_write_outcome_unknown(&self) -> bool {
        matches!(
            self,
            ReconcileError::Permanent {
                source: FailureCause::WriteOutcomeUnknown(_),
                ..
            }
        )
    }

    fn from_single_call(entity_id: &EntityId, err: StoreError) -> Self {
        let entity_id = entity_id.clone();
        match err.class() {
            FailureClass::Transient => ReconcileError::Transient {
                entity_id,
                attempts: 1,
                source: err,
            },
            FailureClass::Unavailable => ReconcileError::StoreUnavailable {
                entity_id,
                attempts: 1,
                source: err,
            },
            FailureClass::Permanent => ReconcileError::Permanent {
                entity_id,
                source: FailureCause::Store(err),
            },
        }
    }
}

impl std::fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::Transient {
                entity_id,
                attempts,
                source,
            } => write!(
                f,
                "entity {entity_id}: transient failure after {attempts} attempt(s): {source}"
            ),
            ReconcileError::Permanent { entity_id, source } => {
                write!(f, "entity {entity_id}: permanent failure: {source}")
            }
            ReconcileError::StoreUnavailable {
                entity_id,
                attempts,
                source,
            } => write!(
                f,
                "entity {entity_id}: store unavailable after {attempts} attempt(s): {source}"
            ),
        }
    }
}

impl std::error::Error for ReconcileError {}

/// Failure of one attempt, before retry classification.
enum StepError {
    Store(StoreError),
    Permanent(FailureCause),
}

impl From<TransitionError> for StepError {
    fn from(e: TransitionError) -> Self {
        StepError::Permanent(FailureCause::IllegalTransition(e))
    }
}

pub struct Reconciler {
    policy: ReconcilePolicy,
    store: Arc<dyn AttributeStore>,
    source: Option<Arc<dyn UnitsSoldSource>>,
    rate: Rate,
    retry: RetryPolicy,
    locks: EntityLocks,
    serialize_recompute: bool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("policy", &self.policy)
            .field("store", &self.store.name())
            .field("attribute", self.store.attribute())
            .field("has_source", &self.source.is_some())
            .field("rate", &self.rate)
            .field("retry", &self.retry)
            .field("serialize_recompute", &self.serialize_recompute)
            .finish()
    }
}

impl Reconciler {
    pub fn new(policy: ReconcilePolicy, store: Arc<dyn AttributeStore>, rate: Rate) -> Self {
        Self {
            policy,
            store,
            source: None,
            rate,
            retry: RetryPolicy::default(),
            locks: EntityLocks::new(),
            serialize_recompute: false,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn UnitsSoldSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Also take the entity lock for recompute jobs.
    pub fn with_serialized_recompute(mut self, on: bool) -> Self {
        self.serialize_recompute = on;
        self
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.locks
    }

    /// The job input the active policy derives from an event contribution.
    pub fn input_for(&self, contribution: Micros) -> ReconcileInput {
        match self.policy {
            ReconcilePolicy::Recompute => ReconcileInput::Recompute,
            ReconcilePolicy::Incremental => ReconcileInput::Contribution(contribution),
        }
    }

    pub async fn reconcile(
        &self,
        entity_id: &EntityId,
        input: ReconcileInput,
    ) -> Result<Micros, ReconcileError> {
        let mut job = ReconcileJob::new(entity_id.clone(), input);
        self.run_job(&mut job).await
    }

    /// Recompute from the units-sold counter regardless of the active policy.
    pub async fn recompute(&self, entity_id: &EntityId) -> Result<Micros, ReconcileError> {
        if self.source.is_none() {
            return Err(ReconcileError::Permanent {
                entity_id: entity_id.clone(),
                source: FailureCause::NoUnitsSoldSource,
            });
        }
        self.reconcile(entity_id, ReconcileInput::Recompute).await
    }

    /// Read-through lookup of the stored total. One call, no retry.
    pub async fn current_total(&self, entity_id: &EntityId) -> Result<Option<Micros>, ReconcileError> {
        self.store
            .get(entity_id)
            .await
            .map_err(|e| ReconcileError::from_single_call(entity_id, e))
    }

    /// Drive `job` to a terminal state, retrying transient failures.
    pub async fn run_job(&self, job: &mut ReconcileJob) -> Result<Micros, ReconcileError> {
        let mut unavailable_failures = 0u32;
        loop {
            let err = match self.attempt(job).await {
                Ok(total) => {
                    info!(
                        entity_id = %job.entity_id,
                        attempts = job.attempts(),
                        total = %total,
                        "total written"
                    );
                    return Ok(total);
                }
                Err(err) => err,
            };

            let store_err = match err {
                StepError::Permanent(cause) => return Err(self.fail(job, cause)),
                StepError::Store(e) => e,
            };

            let attempts = job.attempts();
            let class = store_err.class();
            if class == FailureClass::Permanent {
                return Err(self.fail(job, FailureCause::Store(store_err)));
            }
            if class == FailureClass::Unavailable {
                unavailable_failures += 1;
            }

            let give_up = self.retry.attempts_exhausted(attempts)
                || (class == FailureClass::Unavailable
                    && self.retry.unavailable_exhausted(unavailable_failures));
            if give_up {
                if let Err(te) = job.transition(JobState::Failed) {
                    return Err(ReconcileError::Permanent {
                        entity_id: job.entity_id.clone(),
                        source: FailureCause::IllegalTransition(te),
                    });
                }
                let entity_id = job.entity_id.clone();
                warn!(
                    entity_id = %entity_id,
                    attempts,
                    error = %store_err,
                    "retry budget spent"
                );
                return Err(match class {
                    FailureClass::Unavailable => ReconcileError::StoreUnavailable {
                        entity_id,
                        attempts,
                        source: store_err,
                    },
                    _ => ReconcileError::Transient {
                        entity_id,
                        attempts,
                        source: store_err,
                    },
                });
            }

            if let Err(te) = job.transition(JobState::Pending) {
                return Err(self.fail(job, FailureCause::IllegalTransition(te)));
            }
            let delay = self.retry.delay(attempts);
            debug!(
                entity_id = %job.entity_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %store_err,
                "transient store failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Move to `Failed` (best effort) and build the permanent error.
    fn fail(&self, job: &mut ReconcileJob, cause: FailureCause) -> ReconcileError {
        if !job.state().is_terminal() {
            let _ = job.transition(JobState::Failed);
        }
        warn!(entity_id = %job.entity_id, cause = %cause, "job failed permanently");
        ReconcileError::Permanent {
            entity_id: job.entity_id.clone(),
            source: cause,
        }
    }

    async fn guard_for(&self, job: &ReconcileJob) -> Option<EntityGuard<'_>> {
        let needs_lock = match job.input {
            ReconcileInput::Contribution(_) => true,
            ReconcileInput::Recompute => self.serialize_recompute,
        };
        if needs_lock {
            Some(self.locks.lock(&job.entity_id).await)
        } else {
            None
        }
    }

    /// One fetch/compute/write pass. The lock guard drops on return.
    async fn attempt(&self, job: &mut ReconcileJob) -> Result<Micros, StepError> {
        let _guard = self.guard_for(job).await;
        job.transition(JobState::FetchingSource)?;

        let total = match job.input {
            ReconcileInput::Contribution(amount) => {
                let current = self
                    .store
                    .get(&job.entity_id)
                    .await
                    .map_err(StepError::Store)?
                    .unwrap_or(Micros::ZERO);
                job.transition(JobState::Computing)?;
                current.checked_add(amount).ok_or_else(|| {
                    StepError::Permanent(FailureCause::Overflow {
                        detail: format!("{current} + {amount}"),
                    })
                })?
            }
            ReconcileInput::Recompute => {
                let source = self
                    .source
                    .as_ref()
                    .ok_or(StepError::Permanent(FailureCause::NoUnitsSoldSource))?;
                let units = source
                    .units_sold(&job.entity_id)
                    .await
                    .map_err(StepError::Store)?
                    .ok_or(StepError::Permanent(FailureCause::UnitsSoldMissing))?;
                job.transition(JobState::Computing)?;
                self.rate.for_units(units).ok_or_else(|| {
                    StepError::Permanent(FailureCause::Overflow {
                        detail: format!("{} * {units}", self.rate.per_unit()),
                    })
                })?
            }
        };

        job.transition(JobState::Writing)?;
        let input = job.input;
        self.store
            .set(&job.entity_id, total)
            .await
            .map_err(|e| match (input, e) {
                (ReconcileInput::Contribution(_), e @ StoreError::Transport(_)) => {
                    StepError::Permanent(FailureCause::WriteOutcomeUnknown(e))
                }
                (_, e) => StepError::Store(e),
            })?;
        job.transition(JobState::Done)?;
        Ok(total)
    }
}
