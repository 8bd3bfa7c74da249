//! Workflow runner
//!
//! Drives one run of a workflow body under a lease: acquire, reconcile,
//! restore (or bootstrap a fresh state with its genesis snapshot), start
//! the heartbeat task, execute the body, record the terminal event, and
//! release the lease on every path except a fenced-out one (where the
//! release would be a no-op anyway).

use std::sync::Arc;

use tracing::{error, info, instrument};

use contd_core::{EventPayload, WorkflowState, WorkflowStatus};

use crate::engine::{EngineError, RunReport};
use crate::idempotency::IdempotencyManager;
use crate::journal::Journal;
use crate::lease::{LeaseError, LeaseManager};
use crate::persistence::DurableStore;
use crate::recovery::{RecoveryEngine, RecoveryError};
use crate::reliability::RetryPolicy;
use crate::snapshots::SnapshotManager;

use super::context::WorkflowContext;
use super::registry::WorkflowBody;
use super::step::StepError;

pub(crate) struct Runner {
    pub store: Arc<dyn DurableStore>,
    pub journal: Journal,
    pub snapshots: SnapshotManager,
    pub idempotency: IdempotencyManager,
    pub leases: LeaseManager,
    pub recovery: RecoveryEngine,
    pub snapshot_interval: u32,
    pub default_retry: RetryPolicy,
}

impl Runner {
    /// Execute one run of `body` over `workflow_id`.
    ///
    /// `fresh` carries the initial state for a first run; `None` resumes
    /// from the stores.
    #[instrument(skip(self, body, fresh), fields(%workflow_id))]
    pub async fn run(
        &self,
        workflow_id: &str,
        body: Arc<dyn WorkflowBody>,
        fresh: Option<WorkflowState>,
    ) -> Result<RunReport, EngineError> {
        let lease = self.leases.acquire(workflow_id).await.map_err(|err| match err {
            LeaseError::WorkflowLocked(id) => EngineError::WorkflowLocked(id),
            LeaseError::LeaseLost(id) => EngineError::Step(StepError::LeaseLost(id)),
            LeaseError::Store(e) => EngineError::Store(e),
        })?;

        let result = self.run_locked(workflow_id, &lease, body, fresh).await;

        // A fenced-out executor must not touch the new owner's lease; for
        // everyone else release is part of the contract.
        if !matches!(&result, Err(EngineError::Step(StepError::LeaseLost(_)))) {
            if let Err(err) = self.leases.release(&lease).await {
                error!(%workflow_id, error = %err, "lease release failed");
            }
        }
        result
    }

    async fn run_locked(
        &self,
        workflow_id: &str,
        lease: &contd_core::Lease,
        body: Arc<dyn WorkflowBody>,
        fresh: Option<WorkflowState>,
    ) -> Result<RunReport, EngineError> {
        // Heal any completion rows a crashed commit left missing before
        // accepting new work.
        self.idempotency.reconcile(workflow_id, &self.journal).await?;

        let (state, last_event_seq) = match fresh {
            Some(state) => {
                // The genesis snapshot pins the input-bearing initial
                // state at seq 0 so that restore always has a base.
                self.snapshots.create(&state, 0).await?;
                (state, 0)
            }
            None => {
                let restored = self.recovery.restore(workflow_id).await.map_err(|err| {
                    match err {
                        RecoveryError::WorkflowNotFound(id) => EngineError::WorkflowNotFound(id),
                        other => EngineError::Recovery(other),
                    }
                })?;
                if restored.terminal.is_some() {
                    return Err(EngineError::WorkflowAlreadyCompleted(
                        workflow_id.to_string(),
                    ));
                }
                (restored.state, restored.last_event_seq)
            }
        };

        let default_retry = retry_policy_from_metadata(&state).unwrap_or_else(|| {
            self.default_retry.clone()
        });

        let heartbeat = self.leases.spawn_heartbeat(lease.clone(), self.journal.clone());

        let mut ctx = WorkflowContext {
            workflow_id: workflow_id.to_string(),
            org_id: state.org_id.clone(),
            state,
            lease: lease.clone(),
            store: self.store.clone(),
            journal: self.journal.clone(),
            snapshots: self.snapshots.clone(),
            idempotency: self.idempotency.clone(),
            default_retry,
            snapshot_interval: self.snapshot_interval,
            stop_rx: heartbeat.stop_signal(),
            invocations: 0,
            steps_since_snapshot: 0,
            last_event_seq,
        };

        let outcome = body.run(&mut ctx).await;
        heartbeat.shutdown().await;

        match outcome {
            Ok(()) => {
                self.journal
                    .append(
                        workflow_id,
                        &ctx.org_id,
                        EventPayload::WorkflowCompleted {
                            final_state_checksum: ctx.state.checksum.clone(),
                        },
                    )
                    .await?;
                info!(%workflow_id, steps = ctx.state.step_number, "workflow completed");
                Ok(RunReport {
                    workflow_id: workflow_id.to_string(),
                    status: WorkflowStatus::Completed,
                    state: ctx.state,
                })
            }

            // Cancellation is a clean outcome: the cancelled event is
            // already in the journal, written by the cancel command.
            Err(StepError::Cancelled { .. }) => {
                info!(%workflow_id, "workflow unwound after cancellation");
                Ok(RunReport {
                    workflow_id: workflow_id.to_string(),
                    status: WorkflowStatus::Cancelled,
                    state: ctx.state,
                })
            }

            Err(err) => {
                if matches!(err, StepError::Integrity(_)) {
                    // Fail closed and leave the journal for forensics.
                    error!(%workflow_id, error = %err, "integrity failure; workflow suspended");
                }
                Err(EngineError::Step(err))
            }
        }
    }
}

fn retry_policy_from_metadata(state: &WorkflowState) -> Option<RetryPolicy> {
    state
        .metadata
        .get("retry_policy")
        .and_then(|value| serde_json::from_value(value.clone()).ok())
}
