//! In-memory implementation of the persistence boundary
//!
//! Primarily for tests. All tables live behind one lock so that the
//! multi-table operations get the same all-or-nothing visibility the
//! PostgreSQL backend provides through transactions.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use contd_core::{CompletedStep, Event, Lease, Snapshot, StepAttempt};

use super::store::{
    AttemptOutcome, BlobStore, DurableStore, IdempotencyStore, JournalStore, LeaseStore,
    SnapshotStore, StoreError,
};

#[derive(Default)]
struct Inner {
    /// Per-workflow event vectors, always ordered by event_seq
    events: HashMap<String, Vec<Event>>,
    event_ids: HashSet<Uuid>,
    snapshots: HashMap<Uuid, Snapshot>,
    leases: HashMap<String, Lease>,
    /// Last fencing token ever issued per workflow; survives release
    lease_tokens: HashMap<String, i64>,
    attempts: HashMap<(String, String), Vec<StepAttempt>>,
    completions: HashMap<(String, String), CompletedStep>,
    blobs: HashMap<String, Vec<u8>>,
}

impl Inner {
    fn next_seq(&self, workflow_id: &str) -> i64 {
        self.events
            .get(workflow_id)
            .and_then(|events| events.last())
            .map(|event| event.event_seq + 1)
            .unwrap_or(1)
    }

    fn insert_event(&mut self, event: Event) -> Result<Event, StoreError> {
        if self.event_ids.contains(&event.event_id) {
            return Err(StoreError::DuplicateEvent(event.event_id));
        }
        let next_seq = self.next_seq(&event.workflow_id);
        let sealed = event.assign_seq(next_seq);
        self.event_ids.insert(sealed.event_id);
        self.events
            .entry(sealed.workflow_id.clone())
            .or_default()
            .push(sealed.clone());
        Ok(sealed)
    }
}

/// In-memory store with the same semantics as the PostgreSQL backend
///
/// # Example
///
/// ```
/// use contd_durable::persistence::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events persisted for a workflow
    pub fn event_count(&self, workflow_id: &str) -> usize {
        self.inner
            .read()
            .events
            .get(workflow_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of snapshots persisted for a workflow
    pub fn snapshot_count(&self, workflow_id: &str) -> usize {
        self.inner
            .read()
            .snapshots
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .count()
    }

    /// Drop a lease without the three-way match, simulating expiry
    /// reclamation by an operator (for tests).
    pub fn evict_lease(&self, workflow_id: &str) {
        self.inner.write().leases.remove(workflow_id);
    }

    /// Overwrite a stored event verbatim, bypassing sealing (for
    /// corruption tests).
    pub fn tamper_event(&self, workflow_id: &str, seq: i64, event: Event) {
        let mut inner = self.inner.write();
        if let Some(events) = inner.events.get_mut(workflow_id) {
            if let Some(slot) = events.iter_mut().find(|e| e.event_seq == seq) {
                *slot = event;
            }
        }
    }

    /// Remove a completion row (for reconciliation tests).
    pub fn drop_completion(&self, workflow_id: &str, step_id: &str) {
        self.inner
            .write()
            .completions
            .remove(&(workflow_id.to_string(), step_id.to_string()));
    }
}

#[async_trait]
impl JournalStore for InMemoryStore {
    async fn append(&self, event: Event) -> Result<Event, StoreError> {
        self.inner.write().insert_event(event)
    }

    async fn read_range(
        &self,
        workflow_id: &str,
        from_seq: i64,
        to_seq: i64,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read();
        let events = inner
            .events
            .get(workflow_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_seq >= from_seq && e.event_seq <= to_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn tail(&self, workflow_id: &str) -> Result<Option<(i64, Uuid)>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .events
            .get(workflow_id)
            .and_then(|events| events.last())
            .map(|event| (event.event_seq, event.event_id)))
    }
}

#[async_trait]
impl SnapshotStore for InMemoryStore {
    async fn put(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.snapshots.entry(snapshot.snapshot_id).or_insert(snapshot);
        Ok(())
    }

    async fn get(&self, snapshot_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.inner.read().snapshots.get(&snapshot_id).cloned())
    }

    async fn get_latest(
        &self,
        workflow_id: &str,
        max_seq: i64,
    ) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .snapshots
            .values()
            .filter(|s| s.workflow_id == workflow_id && s.last_event_seq <= max_seq)
            .max_by_key(|s| (s.last_event_seq, s.created_at))
            .cloned())
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.read();
        let mut snapshots: Vec<Snapshot> = inner
            .snapshots
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.last_event_seq.cmp(&a.last_event_seq));
        Ok(snapshots)
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn acquire(
        &self,
        workflow_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Lease, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        if let Some(existing) = inner.leases.get(workflow_id) {
            if !existing.is_expired(now) && existing.owner_id != owner_id {
                return Err(StoreError::LeaseHeld {
                    workflow_id: workflow_id.to_string(),
                    owner_id: existing.owner_id.clone(),
                    expires_at: existing.lease_expires_at,
                });
            }
        }

        let token = inner
            .lease_tokens
            .get(workflow_id)
            .copied()
            .unwrap_or(0)
            + 1;
        let lease = Lease::granted(workflow_id, owner_id, token, ttl, now);
        inner.lease_tokens.insert(workflow_id.to_string(), token);
        inner.leases.insert(workflow_id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let stored = inner
            .leases
            .get_mut(&lease.workflow_id)
            .filter(|stored| stored.key() == lease.key())
            .ok_or_else(|| StoreError::LeaseMismatch(lease.workflow_id.clone()))?;

        stored.heartbeat_at = now;
        stored.lease_expires_at =
            now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(30));
        Ok(stored.clone())
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let matches = inner
            .leases
            .get(&lease.workflow_id)
            .map(|stored| stored.key() == lease.key())
            .unwrap_or(false);
        if matches {
            inner.leases.remove(&lease.workflow_id);
        }
        Ok(())
    }

    async fn get_lease(&self, workflow_id: &str) -> Result<Option<Lease>, StoreError> {
        Ok(self.inner.read().leases.get(workflow_id).cloned())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletedStep>, StoreError> {
        Ok(self
            .inner
            .read()
            .completions
            .get(&(workflow_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        fencing_token: i64,
    ) -> Result<AttemptOutcome, StoreError> {
        let mut inner = self.inner.write();

        let token_ok = inner
            .leases
            .get(workflow_id)
            .map(|lease| lease.fencing_token == fencing_token)
            .unwrap_or(false);
        if !token_ok {
            return Err(StoreError::LeaseMismatch(workflow_id.to_string()));
        }

        let key = (workflow_id.to_string(), step_id.to_string());
        if let Some(done) = inner.completions.get(&key) {
            return Ok(AttemptOutcome::AlreadyCompleted(done.clone()));
        }

        let attempt_id = inner
            .attempts
            .get(&key)
            .and_then(|attempts| attempts.last())
            .map(|attempt| attempt.attempt_id + 1)
            .unwrap_or(1);
        let attempt = StepAttempt {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            attempt_id,
            started_at: Utc::now(),
            fencing_token,
        };
        inner.attempts.entry(key).or_default().push(attempt.clone());
        Ok(AttemptOutcome::Allocated(attempt))
    }

    async fn mark_completed(&self, completion: CompletedStep) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        insert_completion(&mut inner, completion)
    }

    async fn list_completions(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<CompletedStep>, StoreError> {
        let inner = self.inner.read();
        let mut completions: Vec<CompletedStep> = inner
            .completions
            .iter()
            .filter(|((wf, _), _)| wf == workflow_id)
            .map(|(_, done)| done.clone())
            .collect();
        completions.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));
        Ok(completions)
    }
}

fn insert_completion(inner: &mut Inner, completion: CompletedStep) -> Result<(), StoreError> {
    let key = (completion.workflow_id.clone(), completion.step_id.clone());
    if let Some(existing) = inner.completions.get(&key) {
        // Identical re-insert is the reconciliation path; anything else
        // violates the one-completion-per-step invariant.
        if existing.attempt_id == completion.attempt_id
            && existing.result_checksum == completion.result_checksum
        {
            return Ok(());
        }
        return Err(StoreError::AlreadyCompleted {
            workflow_id: completion.workflow_id,
            step_id: completion.step_id,
        });
    }
    inner.completions.insert(key, completion);
    Ok(())
}

#[async_trait]
impl BlobStore for InMemoryStore {
    async fn put_blob(&self, reference: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.inner
            .write()
            .blobs
            .insert(reference.to_string(), bytes);
        Ok(())
    }

    async fn get_blob(&self, reference: &str) -> Result<Vec<u8>, StoreError> {
        self.inner
            .read()
            .blobs
            .get(reference)
            .cloned()
            .ok_or_else(|| StoreError::BlobMissing(reference.to_string()))
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn append_with_completion(
        &self,
        event: Event,
        completion: CompletedStep,
        fencing_token: i64,
    ) -> Result<Event, StoreError> {
        let mut inner = self.inner.write();

        // Fencing check first: a stale owner's completion must be refused
        // even when the step has no completion row yet.
        let token_ok = inner
            .leases
            .get(&completion.workflow_id)
            .map(|lease| lease.fencing_token == fencing_token)
            .unwrap_or(false);
        if !token_ok {
            return Err(StoreError::LeaseMismatch(completion.workflow_id));
        }

        // Reject before touching the journal so neither side is visible
        // on failure.
        let key = (completion.workflow_id.clone(), completion.step_id.clone());
        if inner.completions.contains_key(&key) {
            return Err(StoreError::AlreadyCompleted {
                workflow_id: completion.workflow_id,
                step_id: completion.step_id,
            });
        }
        let sealed = inner.insert_event(event)?;
        inner.completions.insert(key, completion);
        Ok(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contd_core::EventPayload;
    use serde_json::json;

    fn intention_event(workflow_id: &str) -> Event {
        Event::new(
            workflow_id,
            "org-1",
            EventPayload::StepIntention {
                step_id: "a_1".to_string(),
                step_name: "a".to_string(),
                attempt_id: 1,
                fencing_token: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_seqs() {
        let store = InMemoryStore::new();

        let first = store.append(intention_event("wf-1")).await.unwrap();
        let second = store.append(intention_event("wf-1")).await.unwrap();
        let other = store.append(intention_event("wf-2")).await.unwrap();

        assert_eq!(first.event_seq, 1);
        assert_eq!(second.event_seq, 2);
        assert_eq!(other.event_seq, 1);
        first.verify_checksum().unwrap();
        second.verify_checksum().unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rejected() {
        let store = InMemoryStore::new();
        let event = intention_event("wf-1");
        let copy = event.clone();

        store.append(event).await.unwrap();
        let err = store.append(copy).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEvent(_)));
    }

    #[tokio::test]
    async fn test_tail_tracks_last_event() {
        let store = InMemoryStore::new();
        assert_eq!(store.tail("wf-1").await.unwrap(), None);

        store.append(intention_event("wf-1")).await.unwrap();
        let sealed = store.append(intention_event("wf-1")).await.unwrap();

        let (seq, id) = store.tail("wf-1").await.unwrap().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(id, sealed.event_id);
    }

    #[tokio::test]
    async fn test_lease_exclusivity_and_takeover() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        let lease = store.acquire("wf-1", "exec-a", ttl).await.unwrap();
        assert_eq!(lease.fencing_token, 1);

        let err = store.acquire("wf-1", "exec-b", ttl).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseHeld { .. }));

        // Simulate expiry, then takeover must bump the token.
        let expired = store
            .acquire("wf-1", "exec-a", Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(expired.fencing_token, 2);
        let taken = store.acquire("wf-1", "exec-b", ttl).await.unwrap();
        assert_eq!(taken.fencing_token, 3);
    }

    #[tokio::test]
    async fn test_fencing_token_survives_release() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        let lease = store.acquire("wf-1", "exec-a", ttl).await.unwrap();
        store.release(&lease).await.unwrap();

        let again = store.acquire("wf-1", "exec-a", ttl).await.unwrap();
        assert_eq!(again.fencing_token, 2);
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_stale_owner() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        let stale = store
            .acquire("wf-1", "exec-a", Duration::from_secs(0))
            .await
            .unwrap();
        let _fresh = store.acquire("wf-1", "exec-b", ttl).await.unwrap();

        let err = store.heartbeat(&stale, ttl).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch(_)));

        // Release by the stale owner is a silent no-op.
        store.release(&stale).await.unwrap();
        assert!(store.get_lease("wf-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_attempt_allocation_increments() {
        let store = InMemoryStore::new();
        let lease = store
            .acquire("wf-1", "exec-a", Duration::from_secs(30))
            .await
            .unwrap();

        for expected in 1..=3u32 {
            match store
                .allocate_attempt("wf-1", "a_1", lease.fencing_token)
                .await
                .unwrap()
            {
                AttemptOutcome::Allocated(attempt) => assert_eq!(attempt.attempt_id, expected),
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_attempt_allocation_enforces_fencing() {
        let store = InMemoryStore::new();
        store
            .acquire("wf-1", "exec-a", Duration::from_secs(30))
            .await
            .unwrap();

        let err = store.allocate_attempt("wf-1", "a_1", 99).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch(_)));
    }

    #[tokio::test]
    async fn test_completion_is_exactly_once() {
        let store = InMemoryStore::new();
        let done = CompletedStep::record("wf-1", "a_1", 1, json!({"y": 2}));

        store.mark_completed(done.clone()).await.unwrap();
        // Identical insert is idempotent (reconciliation path).
        store.mark_completed(done.clone()).await.unwrap();

        let other = CompletedStep::record("wf-1", "a_1", 2, json!({"y": 3}));
        let err = store.mark_completed(other).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyCompleted { .. }));
    }

    #[tokio::test]
    async fn test_append_with_completion_is_atomic() {
        let store = InMemoryStore::new();
        let lease = store
            .acquire("wf-1", "exec-a", Duration::from_secs(30))
            .await
            .unwrap();
        let done = CompletedStep::record("wf-1", "a_1", 1, json!({"y": 2}));
        store.mark_completed(done.clone()).await.unwrap();

        // A second commit for the same step must leave the journal alone.
        let event = intention_event("wf-1");
        let err = store
            .append_with_completion(event, done, lease.fencing_token)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyCompleted { .. }));
        assert_eq!(store.event_count("wf-1"), 0);
    }

    #[tokio::test]
    async fn test_append_with_completion_enforces_fencing() {
        let store = InMemoryStore::new();
        store
            .acquire("wf-1", "exec-a", Duration::from_secs(30))
            .await
            .unwrap();

        // A stale token is refused before either write lands, even though
        // the step has never completed.
        let done = CompletedStep::record("wf-1", "a_1", 1, json!({"y": 2}));
        let err = store
            .append_with_completion(intention_event("wf-1"), done, 99)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseMismatch(_)));
        assert_eq!(store.event_count("wf-1"), 0);
        assert!(store.check_completed("wf-1", "a_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_put_is_idempotent() {
        use contd_core::{Snapshot, Variables, WorkflowState};

        let store = InMemoryStore::new();
        let state = WorkflowState::initial(
            "wf-1",
            "org-1",
            "flow",
            Variables::new(),
            Variables::new(),
            Utc::now(),
        );
        let snapshot = Snapshot::inline(state, 4);

        store.put(snapshot.clone()).await.unwrap();
        store.put(snapshot.clone()).await.unwrap();
        assert_eq!(store.snapshot_count("wf-1"), 1);

        let latest = store.get_latest("wf-1", 10).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, snapshot.snapshot_id);
        assert_eq!(store.get_latest("wf-1", 3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blob_round_trip() {
        let store = InMemoryStore::new();
        store
            .put_blob("blob/wf-1/x", b"payload".to_vec())
            .await
            .unwrap();
        assert_eq!(store.get_blob("blob/wf-1/x").await.unwrap(), b"payload");
        assert!(matches!(
            store.get_blob("missing").await.unwrap_err(),
            StoreError::BlobMissing(_)
        ));
    }
}
