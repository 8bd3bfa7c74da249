//! Workflow execution context
//!
//! The per-invocation context threaded through a workflow body: identity,
//! the live state, the fencing token of the lease the executor holds, the
//! engine handles, and the cancellation channel fed by the heartbeat
//! task. No process-wide state is involved; everything a step needs
//! travels in here.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use contd_core::{Lease, SavepointNote, Variables, WorkflowState};

use crate::idempotency::IdempotencyManager;
use crate::journal::Journal;
use crate::lease::StopReason;
use crate::persistence::DurableStore;
use crate::reliability::RetryPolicy;
use crate::snapshots::SnapshotManager;

use super::step::{self, StepError};

/// A failure raised by a user step function
///
/// `kind` is a stable machine-readable class (it lands in the journal and
/// is matched against the retry policy's retryable set); `message` is for
/// humans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
}

impl StepFailure {
    /// A failure that the retry policy may try again
    pub fn retryable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that terminates the step regardless of budget
    pub fn fatal(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StepFailure {}

/// Per-step configuration
#[derive(Debug, Clone)]
pub struct StepOptions {
    /// Exempt this step from the snapshot cadence when false
    pub checkpoint: bool,

    /// Wall-clock bound on a single attempt
    pub timeout: Option<Duration>,

    /// Overrides the workflow's retry policy for this step
    pub retry: Option<RetryPolicy>,

    /// Snapshot after this step and record an addressable savepoint
    pub savepoint: Option<SavepointNote>,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            checkpoint: true,
            timeout: None,
            retry: None,
            savepoint: None,
        }
    }
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn without_checkpoint(mut self) -> Self {
        self.checkpoint = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_savepoint(mut self, note: SavepointNote) -> Self {
        self.savepoint = Some(note);
        self
    }
}

/// Context handed to a workflow body for the duration of one run
pub struct WorkflowContext {
    pub(crate) workflow_id: String,
    pub(crate) org_id: String,
    pub(crate) state: WorkflowState,
    pub(crate) lease: Lease,
    pub(crate) store: Arc<dyn DurableStore>,
    pub(crate) journal: Journal,
    pub(crate) snapshots: SnapshotManager,
    pub(crate) idempotency: IdempotencyManager,
    pub(crate) default_retry: RetryPolicy,
    pub(crate) snapshot_interval: u32,
    pub(crate) stop_rx: watch::Receiver<Option<StopReason>>,
    /// Step invocations so far in this run; drives step_id generation
    pub(crate) invocations: u64,
    pub(crate) steps_since_snapshot: u32,
    pub(crate) last_event_seq: i64,
}

impl WorkflowContext {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    /// The live state, including all committed step results
    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn variables(&self) -> &Variables {
        &self.state.variables
    }

    /// Token of the lease this run holds; stale writers are refused by it
    pub fn fencing_token(&self) -> i64 {
        self.lease.fencing_token
    }

    /// Whether the heartbeat task has signalled this run to stop
    pub fn stop_requested(&self) -> Option<StopReason> {
        *self.stop_rx.borrow()
    }

    /// Run a step with default options.
    ///
    /// See [`WorkflowContext::step_with`].
    pub async fn step<F, Fut>(&mut self, name: &str, f: F) -> Result<Value, StepError>
    where
        F: Fn(Value) -> Fut + Send,
        Fut: std::future::Future<Output = Result<Value, StepFailure>> + Send,
    {
        self.step_with(name, StepOptions::new(), f).await
    }

    /// Run a step under the exactly-once-commit protocol.
    ///
    /// The function receives the current variables and must return an
    /// object whose entries are merged into them. If this logical step
    /// already committed (crash/resume, lease takeover), `f` is not called
    /// and the recorded result is returned.
    ///
    /// The engine guarantees exactly-once commit per step, and
    /// at-most-once execution under a valid lease. Across lease takeovers
    /// `f` may run more than once; non-idempotent external effects must be
    /// keyed by `(workflow_id, step_id)` on the remote side they touch.
    pub async fn step_with<F, Fut>(
        &mut self,
        name: &str,
        options: StepOptions,
        f: F,
    ) -> Result<Value, StepError>
    where
        F: Fn(Value) -> Fut + Send,
        Fut: std::future::Future<Output = Result<Value, StepFailure>> + Send,
    {
        step::run_step(self, name, options, f).await
    }
}
