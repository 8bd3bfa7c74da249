//! Journal manager
//!
//! Thin layer over `JournalStore` that owns the read-side integrity
//! discipline: every event read back is checksum-verified and the
//! sequence is checked for gaps. Any violation is fatal; partial
//! histories are never returned.

use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use contd_core::{Event, EventPayload, IntegrityError};

use crate::persistence::{DurableStore, JournalStore, StoreError};

/// Errors from journal operations
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Append and read events with integrity checking
#[derive(Clone)]
pub struct Journal {
    store: Arc<dyn DurableStore>,
}

impl Journal {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Append a payload as the next event for the workflow.
    #[instrument(skip(self, payload), fields(%workflow_id))]
    pub async fn append(
        &self,
        workflow_id: &str,
        org_id: &str,
        payload: EventPayload,
    ) -> Result<Event, JournalError> {
        let event = Event::new(workflow_id, org_id, payload);
        let sealed = self.store.append(event).await?;
        debug!(seq = sealed.event_seq, event_type = %sealed.event_type(), "appended event");
        Ok(sealed)
    }

    /// Read events strictly after `after_seq`, verified and gap-checked.
    ///
    /// The first event returned must carry `after_seq + 1`; each following
    /// event must increment by exactly one.
    pub async fn read_after(
        &self,
        workflow_id: &str,
        after_seq: i64,
    ) -> Result<Vec<Event>, JournalError> {
        let events = self
            .store
            .read_range(workflow_id, after_seq + 1, i64::MAX)
            .await?;

        let mut expected = after_seq + 1;
        for event in &events {
            event.verify_checksum()?;
            if event.event_seq != expected {
                return Err(IntegrityError::EventSequenceGap {
                    workflow_id: workflow_id.to_string(),
                    expected,
                    found: event.event_seq,
                }
                .into());
            }
            expected += 1;
        }
        Ok(events)
    }

    /// Full verified history of a workflow.
    pub async fn read_all(&self, workflow_id: &str) -> Result<Vec<Event>, JournalError> {
        self.read_after(workflow_id, 0).await
    }

    /// Highest `(event_seq, event_id)` persisted, if any.
    pub async fn tail(&self, workflow_id: &str) -> Result<Option<(i64, Uuid)>, JournalError> {
        Ok(self.store.tail(workflow_id).await?)
    }
}
