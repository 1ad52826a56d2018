//! tally-reconcile
//!
//! Event-to-total pipeline:
//!
//! ```text
//! bytes -> ingress -> aggregate -> one ReconcileJob per entity -> store
//! ```
//!
//! - Ingress validates structure and filters non-payable events.
//! - The aggregator is pure: line items in, per-entity contributions out.
//! - The reconciler owns retry, locking and the job state machine.
//! - The coordinator fans jobs out concurrently and isolates failures per
//!   entity.
//!
//! Totals are derived (`rate * units_sold`) under the default recompute
//! policy, so redelivery and concurrent delivery converge. The incremental
//! policy is available but relies on per-entity locks plus an in-memory
//! dedupe window.

pub mod aggregate;
pub mod coordinator;
pub mod dedupe;
pub mod ingress;
pub mod job;
pub mod lock;
pub mod reconciler;
pub mod retry;

pub use aggregate::{aggregate, AggregateError, Aggregation, Contribution, Contributions, Rate};
pub use coordinator::{
    BatchResult, BatchStatus, Coordinator, CoordinatorSettings, EntityFailure, EntityTotal,
    EventHandler, IngestError,
};
pub use dedupe::{Claim, DedupeClaim, EventDedupe};
pub use ingress::{
    parse_event, parse_event_value, Ingress, IngressRules, LineItem, MalformedEventError,
    MalformedKind, PaymentEvent, SkipReason,
};
pub use job::{JobState, ReconcileJob, TransitionError};
pub use lock::{EntityGuard, EntityLocks};
pub use reconciler::{
    ErrorKind, FailureCause, ReconcileError, ReconcileInput, ReconcilePolicy, Reconciler,
};
pub use retry::RetryPolicy;
