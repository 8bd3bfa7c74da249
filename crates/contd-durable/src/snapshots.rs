//! Snapshot manager
//!
//! Captures sealed workflow states keyed by the last event sequence they
//! cover. States over the inline threshold go to blob storage first and
//! are verified by read-back before the metadata row is written, so an
//! orphan row without a matching blob is never created.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use contd_core::{
    IntegrityError, Snapshot, SnapshotState, WorkflowState, DEFAULT_INLINE_THRESHOLD,
};

use crate::persistence::{BlobStore, DurableStore, SnapshotStore, StoreError};

/// Errors from snapshot operations
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Create and load snapshots with inline/external state split
#[derive(Clone)]
pub struct SnapshotManager {
    store: Arc<dyn DurableStore>,
    inline_threshold: usize,
}

impl SnapshotManager {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }

    pub fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    /// Capture `state` as a snapshot covering `last_event_seq`.
    ///
    /// The state must be sealed; a stale checksum here would poison every
    /// later restore, so it is rejected up front.
    #[instrument(skip(self, state), fields(workflow_id = %state.workflow_id, last_event_seq))]
    pub async fn create(
        &self,
        state: &WorkflowState,
        last_event_seq: i64,
    ) -> Result<Snapshot, SnapshotError> {
        state.verify_integrity()?;

        let snapshot = if state.encoded_size() <= self.inline_threshold {
            Snapshot::inline(state.clone(), last_event_seq)
        } else {
            let bytes = serde_json::to_vec(state)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let snapshot = Snapshot::external(state, last_event_seq, String::new());
            let reference = format!("blobs/{}/{}", state.workflow_id, snapshot.snapshot_id);

            self.store.put_blob(&reference, bytes).await?;
            // Read back before the metadata row exists; a bad blob must
            // not become reachable.
            let stored = self.store.get_blob(&reference).await?;
            let decoded: WorkflowState = serde_json::from_slice(&stored)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            if decoded.checksum != state.checksum {
                return Err(IntegrityError::SnapshotCorrupted {
                    snapshot_id: snapshot.snapshot_id,
                    reason: "external blob failed read-back verification".to_string(),
                }
                .into());
            }

            Snapshot {
                state: SnapshotState::External { reference },
                ..snapshot
            }
        };

        self.store.put(snapshot.clone()).await?;
        debug!(snapshot_id = %snapshot.snapshot_id, inline = snapshot.is_inline(), "snapshot created");
        Ok(snapshot)
    }

    /// Decode and verify the state captured by a snapshot.
    pub async fn load_state(&self, snapshot: &Snapshot) -> Result<WorkflowState, SnapshotError> {
        let state = match &snapshot.state {
            SnapshotState::Inline { state } => state.clone(),
            SnapshotState::External { reference } => {
                let bytes = self.store.get_blob(reference).await?;
                serde_json::from_slice(&bytes).map_err(|e| IntegrityError::SnapshotCorrupted {
                    snapshot_id: snapshot.snapshot_id,
                    reason: format!("external state failed to decode: {e}"),
                })?
            }
        };

        if state.checksum != snapshot.state_checksum {
            return Err(IntegrityError::SnapshotCorrupted {
                snapshot_id: snapshot.snapshot_id,
                reason: "state checksum does not match snapshot record".to_string(),
            }
            .into());
        }
        state.verify_integrity()?;
        Ok(state)
    }

    /// The snapshot with the greatest `last_event_seq <= max_seq`.
    pub async fn latest(
        &self,
        workflow_id: &str,
        max_seq: i64,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.store.get_latest(workflow_id, max_seq).await?)
    }

    pub async fn get(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.store.get(snapshot_id).await?)
    }

    /// All snapshots for the workflow, descending `last_event_seq`.
    pub async fn list(&self, workflow_id: &str) -> Result<Vec<Snapshot>, SnapshotError> {
        Ok(self.store.list(workflow_id).await?)
    }
}
