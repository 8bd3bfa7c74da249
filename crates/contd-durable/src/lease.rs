//! Lease manager and heartbeat task
//!
//! Admission control: exactly one executor owns a workflow at a time,
//! enforced by the lease store's compare-and-set semantics and made safe
//! across takeovers by fencing tokens. The heartbeat task renews the
//! lease at TTL/3 and doubles as the cancellation poller: a failed
//! renewal or an externally recorded `workflow_cancelled` event stops the
//! executor's work through a watch channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use contd_core::Lease;

use crate::journal::Journal;
use crate::persistence::{DurableStore, LeaseStore, StoreError};

/// Why in-flight work must stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The heartbeat was rejected; another executor holds the lease
    LeaseLost,

    /// A workflow_cancelled event was observed in the journal
    Cancelled,
}

/// Errors from lease operations
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// A live lease with a different owner exists
    #[error("workflow {0} is locked by another executor")]
    WorkflowLocked(String),

    /// The owner has been fenced out; all work must stop
    #[error("lease for workflow {0} was lost")]
    LeaseLost(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LeaseError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LeaseHeld { workflow_id, .. } => Self::WorkflowLocked(workflow_id),
            StoreError::LeaseMismatch(workflow_id) => Self::LeaseLost(workflow_id),
            other => Self::Store(other),
        }
    }
}

/// Acquire, renew, and release executor leases
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn DurableStore>,
    owner_id: String,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn DurableStore>, owner_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            owner_id: owner_id.into(),
            ttl,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Acquire the lease for a workflow or fail with `WorkflowLocked`.
    #[instrument(skip(self), fields(owner_id = %self.owner_id))]
    pub async fn acquire(&self, workflow_id: &str) -> Result<Lease, LeaseError> {
        let lease = self
            .store
            .acquire(workflow_id, &self.owner_id, self.ttl)
            .await?;
        info!(%workflow_id, fencing_token = lease.fencing_token, "lease acquired");
        Ok(lease)
    }

    pub async fn heartbeat(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        Ok(self.store.heartbeat(lease, self.ttl).await?)
    }

    pub async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        self.store.release(lease).await?;
        debug!(workflow_id = %lease.workflow_id, "lease released");
        Ok(())
    }

    pub async fn current(&self, workflow_id: &str) -> Result<Option<Lease>, LeaseError> {
        Ok(self.store.get_lease(workflow_id).await?)
    }

    /// Spawn the background renewal loop for a held lease.
    ///
    /// The loop ticks at TTL/3. Each tick renews the lease and scans the
    /// journal tail for a cancellation event; either failure mode is
    /// published on the returned watch channel and ends the loop.
    pub fn spawn_heartbeat(&self, lease: Lease, journal: Journal) -> HeartbeatTask {
        let (stop_tx, stop_rx) = watch::channel(None);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = self.clone();
        let interval = self.ttl / 3;

        let handle = tokio::spawn(async move {
            let workflow_id = lease.workflow_id.clone();
            let mut seen_seq = 0i64;
            let mut lease = lease;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        // A closed channel means the task handle was
                        // dropped; stop renewing either way.
                        if changed.is_err() || *shutdown_rx.borrow() {
                            debug!(%workflow_id, "heartbeat loop shutting down");
                            return;
                        }
                        continue;
                    }
                }

                match manager.heartbeat(&lease).await {
                    Ok(renewed) => lease = renewed,
                    Err(LeaseError::LeaseLost(_)) => {
                        warn!(%workflow_id, "fenced out; signalling executor to stop");
                        let _ = stop_tx.send(Some(StopReason::LeaseLost));
                        return;
                    }
                    Err(err) => {
                        // A transient store failure is survivable until the
                        // lease actually expires; keep ticking.
                        warn!(%workflow_id, error = %err, "heartbeat failed");
                        continue;
                    }
                }

                match cancellation_requested(&journal, &workflow_id, &mut seen_seq).await {
                    Ok(true) => {
                        info!(%workflow_id, "cancellation observed");
                        let _ = stop_tx.send(Some(StopReason::Cancelled));
                        return;
                    }
                    Ok(false) => {}
                    Err(err) => warn!(%workflow_id, error = %err, "cancellation poll failed"),
                }
            }
        });

        HeartbeatTask {
            handle,
            shutdown_tx,
            stop_rx,
        }
    }
}

async fn cancellation_requested(
    journal: &Journal,
    workflow_id: &str,
    seen_seq: &mut i64,
) -> Result<bool, crate::journal::JournalError> {
    let tail = journal.tail(workflow_id).await?;
    let max_seq = match tail {
        Some((seq, _)) if seq > *seen_seq => seq,
        _ => return Ok(false),
    };

    let fresh = journal.read_after(workflow_id, *seen_seq).await?;
    *seen_seq = max_seq;
    Ok(fresh.iter().any(|event| {
        matches!(
            event.payload,
            contd_core::EventPayload::WorkflowCancelled { .. }
        )
    }))
}

/// Handle to a running heartbeat loop
pub struct HeartbeatTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<Option<StopReason>>,
}

impl HeartbeatTask {
    /// Channel carrying the stop signal, for `tokio::select!` in steps.
    pub fn stop_signal(&self) -> watch::Receiver<Option<StopReason>> {
        self.stop_rx.clone()
    }

    /// Whether a stop was signalled so far.
    pub fn stopped(&self) -> Option<StopReason> {
        *self.stop_rx.borrow()
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryStore;
    use contd_core::EventPayload;

    fn setup(ttl: Duration) -> (Arc<InMemoryStore>, LeaseManager, Journal) {
        let store = Arc::new(InMemoryStore::new());
        let manager = LeaseManager::new(store.clone(), "exec-a", ttl);
        let journal = Journal::new(store.clone());
        (store, manager, journal)
    }

    #[tokio::test]
    async fn test_acquire_conflict_maps_to_locked() {
        let (store, manager, _journal) = setup(Duration::from_secs(30));
        let other = LeaseManager::new(store, "exec-b", Duration::from_secs(30));

        manager.acquire("wf-1").await.unwrap();
        let err = other.acquire("wf-1").await.unwrap_err();
        assert!(matches!(err, LeaseError::WorkflowLocked(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_loss_is_fatal() {
        let (store, manager, _journal) = setup(Duration::from_secs(30));
        let lease = manager.acquire("wf-1").await.unwrap();

        store.evict_lease("wf-1");
        let err = manager.heartbeat(&lease).await.unwrap_err();
        assert!(matches!(err, LeaseError::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_task_signals_lease_loss() {
        let (store, manager, journal) = setup(Duration::from_millis(30));
        let lease = manager.acquire("wf-1").await.unwrap();

        let task = manager.spawn_heartbeat(lease, journal);
        let mut stop_rx = task.stop_signal();

        // Evict the lease; the next tick must observe the mismatch.
        store.evict_lease("wf-1");
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                stop_rx.changed().await.unwrap();
                if stop_rx.borrow().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("heartbeat task should signal loss");

        assert_eq!(task.stopped(), Some(StopReason::LeaseLost));
    }

    #[tokio::test]
    async fn test_heartbeat_task_observes_cancellation() {
        let (_store, manager, journal) = setup(Duration::from_millis(30));
        let lease = manager.acquire("wf-1").await.unwrap();

        let task = manager.spawn_heartbeat(lease, journal.clone());
        let mut stop_rx = task.stop_signal();

        journal
            .append(
                "wf-1",
                "org-1",
                EventPayload::WorkflowCancelled {
                    reason: "operator".to_string(),
                },
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                stop_rx.changed().await.unwrap();
                if stop_rx.borrow().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("heartbeat task should observe cancellation");

        assert_eq!(task.stopped(), Some(StopReason::Cancelled));
    }

    #[tokio::test]
    async fn test_shutdown_is_clean() {
        let (_store, manager, journal) = setup(Duration::from_millis(50));
        let lease = manager.acquire("wf-1").await.unwrap();

        let task = manager.spawn_heartbeat(lease, journal);
        task.shutdown().await;
    }
}
