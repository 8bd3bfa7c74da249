//! Workflow state snapshots
//!
//! A snapshot captures a full workflow state together with the highest
//! event sequence it covers. Restore trusts a verified snapshot up to
//! `last_event_seq` and replays only the events after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::WorkflowState;

/// States at or under this serialized size are stored inline (100 KiB)
pub const DEFAULT_INLINE_THRESHOLD: usize = 100 * 1024;

/// Where the snapshot's state lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotState {
    /// Small states are embedded in the snapshot row
    Inline { state: WorkflowState },

    /// Large states live in blob storage under an opaque reference
    External { reference: String },
}

/// An immutable snapshot record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub workflow_id: String,
    pub org_id: String,

    /// Step count at capture time
    pub step_number: u64,

    /// Highest event sequence this snapshot covers
    pub last_event_seq: i64,

    pub state: SnapshotState,

    /// Checksum of the captured state (matches state.checksum)
    pub state_checksum: String,

    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Build an inline snapshot of a sealed state.
    pub fn inline(state: WorkflowState, last_event_seq: i64) -> Self {
        Self {
            snapshot_id: Uuid::now_v7(),
            workflow_id: state.workflow_id.clone(),
            org_id: state.org_id.clone(),
            step_number: state.step_number,
            last_event_seq,
            state_checksum: state.checksum.clone(),
            created_at: Utc::now(),
            state: SnapshotState::Inline { state },
        }
    }

    /// Build a snapshot whose state was written to blob storage.
    pub fn external(
        state: &WorkflowState,
        last_event_seq: i64,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            snapshot_id: Uuid::now_v7(),
            workflow_id: state.workflow_id.clone(),
            org_id: state.org_id.clone(),
            step_number: state.step_number,
            last_event_seq,
            state_checksum: state.checksum.clone(),
            created_at: Utc::now(),
            state: SnapshotState::External {
                reference: reference.into(),
            },
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.state, SnapshotState::Inline { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Variables;

    fn test_state() -> WorkflowState {
        WorkflowState::initial(
            "wf-1",
            "org-1",
            "flow",
            Variables::new(),
            Variables::new(),
            Utc::now(),
        )
    }

    #[test]
    fn test_inline_snapshot_copies_identity() {
        let state = test_state();
        let checksum = state.checksum.clone();
        let snapshot = Snapshot::inline(state, 7);

        assert_eq!(snapshot.workflow_id, "wf-1");
        assert_eq!(snapshot.last_event_seq, 7);
        assert_eq!(snapshot.state_checksum, checksum);
        assert!(snapshot.is_inline());
    }

    #[test]
    fn test_external_snapshot_keeps_reference() {
        let state = test_state();
        let snapshot = Snapshot::external(&state, 3, "blob/wf-1/3");

        assert!(!snapshot.is_inline());
        match &snapshot.state {
            SnapshotState::External { reference } => assert_eq!(reference, "blob/wf-1/3"),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_serialization_round_trip() {
        let snapshot = Snapshot::inline(test_state(), 1);
        let encoded = serde_json::to_string(&snapshot).unwrap();
        assert!(encoded.contains(r#""kind":"inline""#));
        let parsed: Snapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(snapshot, parsed);
    }
}
