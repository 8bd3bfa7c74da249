//! Idempotency manager
//!
//! Wraps the idempotency store and owns the startup reconciliation pass:
//! where the journal and the completion table could diverge (a crash
//! between commit phases on a split backend), any `step_completed` event
//! without a completion row is authoritative and the missing row is
//! filled before new work is accepted.

use std::sync::Arc;

use tracing::{info, instrument};

use contd_core::{CompletedStep, DeltaEntry, EventPayload, StateDelta};

use crate::journal::{Journal, JournalError};
use crate::persistence::{AttemptOutcome, DurableStore, IdempotencyStore, StoreError};

/// Errors from idempotency operations
#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Attempt allocation and completion bookkeeping
#[derive(Clone)]
pub struct IdempotencyManager {
    store: Arc<dyn DurableStore>,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    pub async fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletedStep>, IdempotencyError> {
        Ok(self.store.check_completed(workflow_id, step_id).await?)
    }

    pub async fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        fencing_token: i64,
    ) -> Result<AttemptOutcome, IdempotencyError> {
        Ok(self
            .store
            .allocate_attempt(workflow_id, step_id, fencing_token)
            .await?)
    }

    /// Fill completion rows for any committed step the table is missing.
    ///
    /// Returns the number of rows created. Idempotent: a second pass over
    /// the same journal creates nothing.
    #[instrument(skip(self, journal), fields(%workflow_id))]
    pub async fn reconcile(
        &self,
        workflow_id: &str,
        journal: &Journal,
    ) -> Result<usize, IdempotencyError> {
        let events = journal.read_all(workflow_id).await?;
        let mut repaired = 0;

        for event in &events {
            let EventPayload::StepCompleted {
                step_id,
                attempt_id,
                state_delta,
                ..
            } = &event.payload
            else {
                continue;
            };

            if self
                .store
                .check_completed(workflow_id, step_id)
                .await?
                .is_some()
            {
                continue;
            }

            let completion = CompletedStep::record(
                workflow_id,
                step_id.clone(),
                *attempt_id,
                result_from_delta(state_delta),
            );
            self.store.mark_completed(completion).await?;
            repaired += 1;
        }

        if repaired > 0 {
            info!(%workflow_id, repaired, "reconciled completion rows from journal");
        }
        Ok(repaired)
    }
}

/// Reconstruct a step's result mapping from its state delta.
///
/// Step results are merged into the variables, so a completion delta only
/// ever adds or replaces keys; those entries are exactly the result.
fn result_from_delta(delta: &StateDelta) -> serde_json::Value {
    let mut result = serde_json::Map::new();
    for entry in &delta.entries {
        match entry {
            DeltaEntry::Add { key, value } | DeltaEntry::Replace { key, value } => {
                result.insert(key.clone(), value.clone());
            }
            DeltaEntry::Remove { .. } => {}
        }
    }
    serde_json::Value::Object(result)
}
