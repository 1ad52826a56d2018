//! Reconciliation job state machine.
//!
//! ```text
//!   Pending ──► FetchingSource ──► Computing ──► Writing ──► Done
//!      ▲              │                │            │
//!      └── transient ─┘                │            │
//!      └───────────────────── transient ────────────┘
//!                     │                │            │
//!                     └──── permanent / budget spent ──► Failed
//! ```
//!
//! `Done` and `Failed` are terminal. Every visited state is recorded so the
//! trail can be inspected after the job finishes.

use tally_schemas::EntityId;

use crate::reconciler::ReconcileInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    FetchingSource,
    Computing,
    Writing,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    fn can_move_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, FetchingSource)
                | (FetchingSource, Computing)
                | (FetchingSource, Pending)
                | (FetchingSource, Failed)
                | (Computing, Writing)
                | (Computing, Failed)
                | (Writing, Done)
                | (Writing, Pending)
                | (Writing, Failed)
        )
    }
}

/// Returned when a job is asked to make a transition its state does not allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub entity_id: EntityId,
    pub from: JobState,
    pub to: JobState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal job transition for entity {}: {:?} -> {:?}",
            self.entity_id, self.from, self.to
        )
    }
}

impl std::error::Error for TransitionError {}

/// One entity's unit of work within an event.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    pub entity_id: EntityId,
    pub input: ReconcileInput,
    state: JobState,
    /// Attempts started so far (incremented on each `Pending -> FetchingSource`).
    attempts: u32,
    trail: Vec<JobState>,
}

impl ReconcileJob {
    pub fn new(entity_id: EntityId, input: ReconcileInput) -> Self {
        Self {
            entity_id,
            input,
            state: JobState::Pending,
            attempts: 0,
            trail: vec![JobState::Pending],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Every state the job has been in, oldest first.
    pub fn trail(&self) -> &[JobState] {
        &self.trail
    }

    pub fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        if !self.state.can_move_to(to) {
            return Err(TransitionError {
                entity_id: self.entity_id.clone(),
                from: self.state,
                to,
            });
        }
        if to == JobState::FetchingSource {
            self.attempts += 1;
        }
        self.state = to;
        self.trail.push(to);
        Ok(())
    }
}
