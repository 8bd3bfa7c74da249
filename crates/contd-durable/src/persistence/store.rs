//! Persistence trait definitions
//!
//! The four core stores (journal, snapshots, leases, idempotency) plus
//! blob storage for oversized snapshot states. `DurableStore` bundles
//! them and adds the one cross-table operation that must be atomic: the
//! step-completion commit.
//!
//! Implementations must be thread-safe and support concurrent access; the
//! engine pushes all cross-executor coordination down to these contracts.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use contd_core::{CompletedStep, Event, Lease, Snapshot, StepAttempt};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow has no journal entries or snapshots
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Another appender took the sequence number and retries ran out
    #[error("sequence conflict for workflow {workflow_id} at seq {seq}")]
    SequenceConflict { workflow_id: String, seq: i64 },

    /// event_id uniqueness violated
    #[error("duplicate event id: {0}")]
    DuplicateEvent(Uuid),

    /// A completion row already exists for this (workflow_id, step_id)
    #[error("step {step_id} of workflow {workflow_id} is already completed")]
    AlreadyCompleted {
        workflow_id: String,
        step_id: String,
    },

    /// A live lease with a different owner exists
    #[error("workflow {workflow_id} is leased by {owner_id} until {expires_at}")]
    LeaseHeld {
        workflow_id: String,
        owner_id: String,
        expires_at: DateTime<Utc>,
    },

    /// The caller's (workflow_id, owner_id, fencing_token) no longer match
    /// the stored lease; the owner has been fenced out
    #[error("lease mismatch for workflow {0}: owner has been fenced out")]
    LeaseMismatch(String),

    /// External state blob is missing
    #[error("blob not found: {0}")]
    BlobMissing(String),

    /// Backend failure
    #[error("database error: {0}")]
    Database(String),

    /// Encoding/decoding failure at the storage boundary
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether a retry at the step level may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::SequenceConflict { .. })
    }
}

/// Outcome of an attempt allocation
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// A new attempt row was inserted
    Allocated(StepAttempt),

    /// The step already committed; the recorded completion is authoritative
    AlreadyCompleted(CompletedStep),
}

/// Append-only event journal.
///
/// Implementations must enforce uniqueness on `(workflow_id, event_seq)`
/// and on `event_id`, and must order reads by `event_seq`, never by
/// timestamp. A conflict on `event_seq` restarts internally or fails with
/// `SequenceConflict`; it never skips silently.
#[async_trait]
pub trait JournalStore: Send + Sync + 'static {
    /// Atomically assign the next `event_seq` for the workflow, stamp the
    /// checksum, and insert. Returns the sealed event.
    async fn append(&self, event: Event) -> Result<Event, StoreError>;

    /// Events with `from_seq <= event_seq <= to_seq`, ascending.
    async fn read_range(
        &self,
        workflow_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> Result<Vec<Event>, StoreError>;

    /// Highest `(event_seq, event_id)` persisted, if any.
    async fn tail(&self, workflow_id: &str) -> Result<Option<(i64, Uuid)>, StoreError>;
}

/// Snapshot metadata and state storage.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Idempotent with respect to `snapshot_id`.
    async fn put(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    async fn get(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    /// The snapshot with the greatest `last_event_seq <= max_seq`.
    async fn get_latest(
        &self,
        workflow_id: &str,
        max_seq: i64,
    ) -> Result<Option<Snapshot>, StoreError>;

    /// All snapshots for the workflow, descending `last_event_seq`.
    async fn list(&self, workflow_id: &str) -> Result<Vec<Snapshot>, StoreError>;
}

/// Single-owner lease admission.
///
/// Fencing tokens strictly increase across the whole history of a
/// workflow, including across release/re-acquire cycles.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Insert or take over an expired lease, issuing the next fencing
    /// token. Fails with `LeaseHeld` while a live foreign lease exists.
    async fn acquire(
        &self,
        workflow_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError>;

    /// Extend expiry by `ttl` iff the three-way identity still matches.
    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError>;

    /// Delete the row under the same three-way match; a mismatch is a
    /// no-op (the lease was already reclaimed).
    async fn release(&self, lease: &Lease) -> Result<(), StoreError>;

    async fn get_lease(&self, workflow_id: &str) -> Result<Option<Lease>, StoreError>;
}

/// Per-step attempt allocation and completion records.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    async fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletedStep>, StoreError>;

    /// Insert the next attempt for `(workflow_id, step_id)`, verifying the
    /// caller still holds the lease with `fencing_token`. Returns the
    /// completion instead if the step already committed.
    async fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        fencing_token: i64,
    ) -> Result<AttemptOutcome, StoreError>;

    /// Insert the completion row. Rejects with `AlreadyCompleted` if
    /// another attempt committed first; idempotent if the identical row
    /// is already present (reconciliation path).
    async fn mark_completed(&self, completion: CompletedStep) -> Result<(), StoreError>;

    /// All completions for a workflow, used by reconciliation.
    async fn list_completions(&self, workflow_id: &str)
        -> Result<Vec<CompletedStep>, StoreError>;
}

/// Opaque blob storage for snapshot states over the inline threshold.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put_blob(&self, reference: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn get_blob(&self, reference: &str) -> Result<Vec<u8>, StoreError>;
}

/// The full persistence boundary of the engine.
///
/// The extra method exists because the step protocol requires the
/// `step_completed` journal append and the completion row to commit
/// together: either both are visible or neither is.
#[async_trait]
pub trait DurableStore:
    JournalStore + SnapshotStore + LeaseStore + IdempotencyStore + BlobStore
{
    /// Append the `step_completed` event and insert the completion row in
    /// a single atomic commit. Returns the sealed event.
    ///
    /// `fencing_token` is re-validated against the live lease inside the
    /// same commit, exactly like `allocate_attempt`: a completion write
    /// from an owner whose token is no longer the stored value fails with
    /// `LeaseMismatch` before anything becomes visible.
    async fn append_with_completion(
        &self,
        event: Event,
        completion: CompletedStep,
        fencing_token: i64,
    ) -> Result<Event, StoreError>;
}
