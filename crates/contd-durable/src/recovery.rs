//! Recovery engine
//!
//! Rebuilds a validated workflow state from the latest usable snapshot
//! plus event replay. Restore is a pure function of the journal and the
//! snapshot store: it takes no locks, writes nothing, and can run against
//! a read replica. Any integrity mismatch fails closed; a partial state
//! is never returned.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use contd_core::{
    Event, EventPayload, EventType, IntegrityError, Lease, Savepoint, WorkflowState,
    WorkflowStatus,
};

use crate::journal::{Journal, JournalError};
use crate::snapshots::{SnapshotError, SnapshotManager};

/// Errors from restore
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("recovery failed for workflow {workflow_id}: {reason}")]
    Failed { workflow_id: String, reason: String },

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// A validated state plus the replay bookkeeping around it
#[derive(Debug, Clone)]
pub struct Restored {
    pub state: WorkflowState,

    /// Sequence of the last event folded into the state
    pub last_event_seq: i64,

    /// Terminal event observed during replay, if any
    pub terminal: Option<EventType>,

    /// Type of the newest event, terminal or not
    pub last_event_type: Option<EventType>,

    /// Intentions and failures replayed, for observability only
    pub intention_count: u32,
    pub failure_count: u32,

    pub savepoints: Vec<Savepoint>,
}

impl Restored {
    /// Derive the lifecycle status, folding in the current lease.
    pub fn status(&self, lease: Option<&Lease>, now: DateTime<Utc>) -> WorkflowStatus {
        match self.terminal {
            Some(EventType::WorkflowCompleted) => return WorkflowStatus::Completed,
            Some(EventType::WorkflowCancelled) => return WorkflowStatus::Cancelled,
            _ => {}
        }
        if lease.map(|l| !l.is_expired(now)).unwrap_or(false) {
            return WorkflowStatus::Running;
        }
        match self.last_event_type {
            Some(EventType::StepFailed) => WorkflowStatus::Failed,
            None => WorkflowStatus::Pending,
            _ => WorkflowStatus::Suspended,
        }
    }
}

/// Snapshot-plus-replay restore
#[derive(Clone)]
pub struct RecoveryEngine {
    journal: Journal,
    snapshots: SnapshotManager,
}

impl RecoveryEngine {
    pub fn new(journal: Journal, snapshots: SnapshotManager) -> Self {
        Self { journal, snapshots }
    }

    /// Rebuild the state of a workflow.
    #[instrument(skip(self), fields(%workflow_id))]
    pub async fn restore(&self, workflow_id: &str) -> Result<Restored, RecoveryError> {
        let snapshot = self.snapshots.latest(workflow_id, i64::MAX).await?;

        let (mut state, base_seq) = match &snapshot {
            Some(snapshot) => {
                let state = self.snapshots.load_state(snapshot).await?;
                (state, snapshot.last_event_seq)
            }
            None => {
                // No snapshot: bootstrap an empty state from the journal's
                // first event. An empty journal means the workflow does
                // not exist.
                let events = self.journal.read_after(workflow_id, 0).await?;
                let Some(first) = events.first() else {
                    return Err(RecoveryError::WorkflowNotFound(workflow_id.to_string()));
                };
                let state = WorkflowState::initial(
                    workflow_id,
                    first.org_id.clone(),
                    "",
                    Default::default(),
                    Default::default(),
                    first.timestamp,
                );
                (state, 0)
            }
        };

        let events = self.journal.read_after(workflow_id, base_seq).await?;
        debug!(base_seq, replayed = events.len(), "replaying events onto snapshot");

        let mut restored = Restored {
            state: state.clone(),
            last_event_seq: base_seq,
            terminal: None,
            last_event_type: None,
            intention_count: 0,
            failure_count: 0,
            savepoints: Vec::new(),
        };

        for event in &events {
            if restored.terminal.is_some() {
                return Err(RecoveryError::Failed {
                    workflow_id: workflow_id.to_string(),
                    reason: format!(
                        "event seq {} follows terminal {}",
                        event.event_seq,
                        restored.terminal.map(|t| t.to_string()).unwrap_or_default()
                    ),
                });
            }
            self.apply(&mut state, &mut restored, event, workflow_id)?;
            restored.last_event_seq = event.event_seq;
            restored.last_event_type = Some(event.event_type());
        }

        state.verify_integrity()?;
        restored.state = state;
        Ok(restored)
    }

    fn apply(
        &self,
        state: &mut WorkflowState,
        restored: &mut Restored,
        event: &Event,
        workflow_id: &str,
    ) -> Result<(), RecoveryError> {
        match &event.payload {
            EventPayload::StepCompleted {
                state_delta,
                new_state_checksum,
                ..
            } => {
                state
                    .apply_completion(state_delta)
                    .map_err(|err| RecoveryError::Failed {
                        workflow_id: workflow_id.to_string(),
                        reason: format!("state delta at seq {}: {err}", event.event_seq),
                    })?;
                // The recorded checksum is the commit-time truth; replay
                // must land on it exactly.
                if &state.checksum != new_state_checksum {
                    return Err(IntegrityError::checksum_mismatch(
                        format!("replayed state at seq {}", event.event_seq),
                        new_state_checksum.clone(),
                        state.checksum.clone(),
                    )
                    .into());
                }
            }
            EventPayload::SavepointCreated { .. } => {
                if let Some(savepoint) =
                    Savepoint::from_payload(workflow_id, event.timestamp, &event.payload)
                {
                    restored.savepoints.push(savepoint);
                }
            }
            EventPayload::StepIntention { .. } => restored.intention_count += 1,
            EventPayload::StepFailed { .. } => restored.failure_count += 1,
            EventPayload::WorkflowCompleted { .. } | EventPayload::WorkflowCancelled { .. } => {
                restored.terminal = Some(event.event_type());
            }
        }
        Ok(())
    }
}
