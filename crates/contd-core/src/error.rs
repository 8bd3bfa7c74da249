//! Integrity failures shared across the data model

use uuid::Uuid;

/// Fatal integrity violations.
///
/// Any of these means the persisted history can no longer be trusted.
/// Callers fail closed: no partial state is ever returned alongside one
/// of these errors.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum IntegrityError {
    /// A stored checksum does not match the recomputed one
    #[error("checksum mismatch for {subject}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        computed: String,
    },

    /// The per-workflow event sequence has a hole
    #[error("event sequence gap for workflow {workflow_id}: expected seq {expected}, found {found}")]
    EventSequenceGap {
        workflow_id: String,
        expected: i64,
        found: i64,
    },

    /// A snapshot failed validation on load
    #[error("snapshot {snapshot_id} is corrupted: {reason}")]
    SnapshotCorrupted { snapshot_id: Uuid, reason: String },
}

impl IntegrityError {
    /// Build a checksum mismatch for a named subject
    pub fn checksum_mismatch(
        subject: impl Into<String>,
        expected: impl Into<String>,
        computed: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            subject: subject.into(),
            expected: expected.into(),
            computed: computed.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = IntegrityError::EventSequenceGap {
            workflow_id: "wf-1".to_string(),
            expected: 4,
            found: 6,
        };
        assert_eq!(
            err.to_string(),
            "event sequence gap for workflow wf-1: expected seq 4, found 6"
        );
    }
}
