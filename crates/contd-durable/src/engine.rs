//! Engine facade: the public command surface
//!
//! Start, Resume, Status, ListSavepoints, TimeTravel, and Cancel, exposed
//! as a local command contract for any transport to sit on. The engine
//! owns the managers and the registry; one engine instance is one
//! executor identity.
//!
//! Step timeouts and cancellation are cooperative: the runtime signals
//! the running step and records the outcome, but cannot pre-empt user
//! code that never yields. Such code still loses its lease at the timer
//! boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument};
use uuid::Uuid;

use contd_core::{
    EventPayload, Lease, Savepoint, Variables, WorkflowState, WorkflowStatus,
    DEFAULT_INLINE_THRESHOLD,
};

use crate::idempotency::{IdempotencyError, IdempotencyManager};
use crate::journal::{Journal, JournalError};
use crate::lease::LeaseManager;
use crate::persistence::{DurableStore, LeaseStore, StoreError};
use crate::recovery::{RecoveryEngine, RecoveryError};
use crate::reliability::RetryPolicy;
use crate::runtime::{Runner, StepError, WorkflowBody, WorkflowRegistry};
use crate::snapshots::{SnapshotError, SnapshotManager};

/// Errors surfaced by engine commands
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Another executor holds a live lease on the workflow
    #[error("workflow {0} is locked by another executor")]
    WorkflowLocked(String),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// The workflow already reached a terminal state
    #[error("workflow {0} is already completed, failed, or cancelled")]
    WorkflowAlreadyCompleted(String),

    /// Start was called with an id that already has history
    #[error("workflow {0} already exists")]
    WorkflowAlreadyExists(String),

    /// No body is registered under the requested workflow name
    #[error("no workflow registered under name {0}")]
    UnknownWorkflow(String),

    /// The savepoint does not exist on this workflow
    #[error("invalid savepoint {savepoint_id} for workflow {workflow_id}")]
    InvalidSavepoint {
        workflow_id: String,
        savepoint_id: Uuid,
    },

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executor identity written into leases
    pub executor_id: String,

    /// Lease TTL; heartbeats renew at TTL/3
    pub lease_ttl: Duration,

    /// Snapshot every N checkpointed steps
    pub snapshot_interval: u32,

    /// Inline/external split threshold for snapshot states
    pub inline_threshold: usize,

    /// Retry policy for workflows that configure none
    pub default_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executor_id: format!("exec-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(30),
            snapshot_interval: 5,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            default_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_executor_id(mut self, executor_id: impl Into<String>) -> Self {
        self.executor_id = executor_id.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u32) -> Self {
        self.snapshot_interval = interval.max(1);
        self
    }

    pub fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }
}

/// Input configuration for starting a workflow
#[derive(Debug, Clone)]
pub struct StartRequest {
    /// Explicit id; generated when absent
    pub workflow_id: Option<String>,

    pub workflow_name: String,
    pub input: Variables,
    pub tags: Variables,
    pub org_id: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

impl StartRequest {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_id: None,
            workflow_name: workflow_name.into(),
            input: Variables::new(),
            tags: Variables::new(),
            org_id: None,
            retry_policy: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_input(mut self, input: Variables) -> Self {
        self.input = input;
        self
    }

    pub fn with_input_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.tags.insert(key.into(), value);
        self
    }

    pub fn with_org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry_policy = Some(retry);
        self
    }
}

/// Result of one run of a workflow
#[derive(Debug, Clone)]
pub struct RunReport {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub state: WorkflowState,
}

/// Derived view of a workflow, computed from the stores
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub step_number: u64,
    pub lease: Option<Lease>,
    pub event_count: i64,
    pub snapshot_count: usize,
    pub savepoints: Vec<Savepoint>,
}

/// The durable execution engine
///
/// # Example
///
/// ```ignore
/// use contd_durable::prelude::*;
///
/// let mut engine = Engine::new(InMemoryStore::new());
/// engine.register(MyWorkflow);
///
/// let report = engine
///     .start(StartRequest::new("my_workflow").with_input_value("x", 1.into()))
///     .await?;
/// ```
pub struct Engine {
    store: Arc<dyn DurableStore>,
    journal: Journal,
    snapshots: SnapshotManager,
    idempotency: IdempotencyManager,
    leases: LeaseManager,
    recovery: RecoveryEngine,
    registry: WorkflowRegistry,
    config: EngineConfig,
}

impl Engine {
    pub fn new(store: impl DurableStore) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: impl DurableStore, config: EngineConfig) -> Self {
        Self::from_arc(Arc::new(store), config)
    }

    /// Build an engine over a shared store handle. Multiple engines over
    /// one store model multiple executors against one backend.
    pub fn from_arc(store: Arc<dyn DurableStore>, config: EngineConfig) -> Self {
        let journal = Journal::new(store.clone());
        let snapshots =
            SnapshotManager::new(store.clone()).with_inline_threshold(config.inline_threshold);
        let idempotency = IdempotencyManager::new(store.clone());
        let leases = LeaseManager::new(store.clone(), config.executor_id.clone(), config.lease_ttl);
        let recovery = RecoveryEngine::new(journal.clone(), snapshots.clone());

        Self {
            store,
            journal,
            snapshots,
            idempotency,
            leases,
            recovery,
            registry: WorkflowRegistry::new(),
            config,
        }
    }

    /// Register a workflow body. The latest registration for a name wins.
    pub fn register(&mut self, body: impl WorkflowBody) {
        self.registry.register(body);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn runner(&self) -> Runner {
        Runner {
            store: self.store.clone(),
            journal: self.journal.clone(),
            snapshots: self.snapshots.clone(),
            idempotency: self.idempotency.clone(),
            leases: self.leases.clone(),
            recovery: self.recovery.clone(),
            snapshot_interval: self.config.snapshot_interval,
            default_retry: self.config.default_retry.clone(),
        }
    }

    /// Start a new workflow and run it on this executor.
    #[instrument(skip(self, request), fields(workflow_name = %request.workflow_name))]
    pub async fn start(&self, request: StartRequest) -> Result<RunReport, EngineError> {
        let body = self
            .registry
            .get(&request.workflow_name)
            .ok_or_else(|| EngineError::UnknownWorkflow(request.workflow_name.clone()))?;

        let workflow_id = request
            .workflow_id
            .clone()
            .unwrap_or_else(|| format!("wf-{}", Uuid::now_v7()));
        if self.journal.tail(&workflow_id).await?.is_some()
            || self.snapshots.latest(&workflow_id, i64::MAX).await?.is_some()
        {
            return Err(EngineError::WorkflowAlreadyExists(workflow_id));
        }

        let org_id = request.org_id.clone().unwrap_or_else(|| "default".to_string());
        let mut state = WorkflowState::initial(
            workflow_id.clone(),
            org_id,
            &request.workflow_name,
            request.input,
            request.tags,
            Utc::now(),
        );
        if let Some(retry) = &request.retry_policy {
            // Persisted so a resume on another executor keeps the policy.
            if let Ok(value) = serde_json::to_value(retry) {
                state.metadata.insert("retry_policy".to_string(), value);
                state.seal();
            }
        }

        info!(%workflow_id, "starting workflow");
        self.runner().run(&workflow_id, body, Some(state)).await
    }

    /// Re-enter a suspended workflow.
    #[instrument(skip(self))]
    pub async fn resume(&self, workflow_id: &str) -> Result<RunReport, EngineError> {
        let restored = self.recovery.restore(workflow_id).await.map_err(not_found)?;
        if restored.terminal.is_some() {
            return Err(EngineError::WorkflowAlreadyCompleted(
                workflow_id.to_string(),
            ));
        }

        let name = restored
            .state
            .workflow_name()
            .unwrap_or_default()
            .to_string();
        let body = self
            .registry
            .get(&name)
            .ok_or_else(|| EngineError::UnknownWorkflow(name.clone()))?;

        info!(%workflow_id, workflow_name = %name, "resuming workflow");
        self.runner().run(workflow_id, body, None).await
    }

    /// Derived status, lease info, and history counts.
    pub async fn status(&self, workflow_id: &str) -> Result<StatusReport, EngineError> {
        let restored = self.recovery.restore(workflow_id).await.map_err(not_found)?;
        let lease = self.store.get_lease(workflow_id).await?;
        let event_count = self
            .journal
            .tail(workflow_id)
            .await?
            .map(|(seq, _)| seq)
            .unwrap_or(0);
        let snapshot_count = self.snapshots.list(workflow_id).await?.len();

        Ok(StatusReport {
            workflow_id: workflow_id.to_string(),
            status: restored.status(lease.as_ref(), Utc::now()),
            step_number: restored.state.step_number,
            lease,
            event_count,
            snapshot_count,
            savepoints: restored.savepoints,
        })
    }

    /// All savepoints recorded for a workflow, oldest first.
    pub async fn list_savepoints(&self, workflow_id: &str) -> Result<Vec<Savepoint>, EngineError> {
        let restored = self.recovery.restore(workflow_id).await.map_err(not_found)?;
        Ok(restored.savepoints)
    }

    /// Branch a new workflow from a savepoint.
    ///
    /// The new workflow starts from the state captured by the savepoint's
    /// snapshot, with an empty journal and idempotency table. The original
    /// workflow is untouched. Returns the new workflow id; run it with
    /// [`Engine::resume`].
    #[instrument(skip(self))]
    pub async fn time_travel(
        &self,
        workflow_id: &str,
        savepoint_id: Uuid,
    ) -> Result<String, EngineError> {
        let restored = self.recovery.restore(workflow_id).await.map_err(not_found)?;
        let savepoint = restored
            .savepoints
            .iter()
            .find(|sp| sp.savepoint_id == savepoint_id)
            .ok_or(EngineError::InvalidSavepoint {
                workflow_id: workflow_id.to_string(),
                savepoint_id,
            })?;

        let snapshot = self
            .snapshots
            .get(savepoint.snapshot_ref)
            .await?
            .ok_or(EngineError::InvalidSavepoint {
                workflow_id: workflow_id.to_string(),
                savepoint_id,
            })?;
        let mut state = self.snapshots.load_state(&snapshot).await?;

        let branched_id = format!("wf-{}", Uuid::now_v7());
        state.workflow_id = branched_id.clone();
        state.metadata.insert(
            "branched_from".to_string(),
            serde_json::json!({
                "workflow_id": workflow_id,
                "savepoint_id": savepoint_id,
            }),
        );
        state.seal();

        // Genesis snapshot of the branch; its journal starts empty.
        self.snapshots.create(&state, 0).await?;
        info!(%workflow_id, %branched_id, %savepoint_id, "branched workflow from savepoint");
        Ok(branched_id)
    }

    /// Record cancellation; in-flight executors observe it on their next
    /// heartbeat and unwind cooperatively.
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError> {
        let restored = self.recovery.restore(workflow_id).await.map_err(not_found)?;
        if restored.terminal.is_some() {
            return Err(EngineError::WorkflowAlreadyCompleted(
                workflow_id.to_string(),
            ));
        }

        self.journal
            .append(
                workflow_id,
                &restored.state.org_id,
                EventPayload::WorkflowCancelled {
                    reason: reason.to_string(),
                },
            )
            .await?;
        info!(%workflow_id, %reason, "workflow cancelled");
        Ok(())
    }
}

fn not_found(err: RecoveryError) -> EngineError {
    match err {
        RecoveryError::WorkflowNotFound(id) => EngineError::WorkflowNotFound(id),
        other => EngineError::Recovery(other),
    }
}
