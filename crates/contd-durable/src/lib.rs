//! # Contd Durable Execution Core
//!
//! A storage-backed workflow engine that makes long-running workflows
//! survive crashes, restarts, and executor failover, while guaranteeing
//! that each step commits exactly once.
//!
//! ## Features
//!
//! - **Append-only journal**: every step intent, completion, failure, and
//!   savepoint is a checksummed event with per-workflow monotonic sequencing
//! - **Snapshots**: step-keyed state captures with inline/external split,
//!   enabling fast restore without full replay
//! - **Leases with fencing tokens**: exactly one executor per workflow,
//!   stale owners fenced out at every write
//! - **Exactly-once commit**: write-ahead intention, at-most-once effect
//!   under a valid lease, atomic completion commit
//! - **Retries and cooperative timeouts**: jittered exponential backoff,
//!   per-step wall-clock bounds, cancellation via the heartbeat channel
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   (Start / Resume / Status / ListSavepoints / TimeTravel /   │
//! │    Cancel; owns the registry and the executor identity)      │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Workflow runtime                         │
//! │  (lease lifecycle, heartbeat task, step protocol, recovery)  │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DurableStore                           │
//! │      (journal, snapshots, leases, idempotency, blobs:        │
//! │       InMemoryStore for tests, PostgresStore for prod)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use contd_durable::prelude::*;
//!
//! struct Enrich;
//!
//! #[async_trait::async_trait]
//! impl WorkflowBody for Enrich {
//!     fn name(&self) -> &str {
//!         "enrich"
//!     }
//!
//!     async fn run(&self, ctx: &mut WorkflowContext) -> Result<(), StepError> {
//!         ctx.step("fetch", |vars| async move {
//!             let id = vars.get("record_id").cloned().unwrap_or_default();
//!             Ok(serde_json::json!({ "record": fetch(id).await? }))
//!         })
//!         .await?;
//!         Ok(())
//!     }
//! }
//!
//! let mut engine = Engine::new(InMemoryStore::new());
//! engine.register(Enrich);
//! let report = engine.start(StartRequest::new("enrich")).await?;
//! ```

pub mod engine;
pub mod idempotency;
pub mod journal;
pub mod lease;
pub mod persistence;
pub mod recovery;
pub mod reliability;
pub mod runtime;
pub mod snapshots;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{Engine, EngineConfig, EngineError, RunReport, StartRequest, StatusReport};
    pub use crate::persistence::{DurableStore, InMemoryStore, PostgresStore, StoreError};
    pub use crate::reliability::RetryPolicy;
    pub use crate::runtime::{
        BodyFn, StepError, StepFailure, StepOptions, WorkflowBody, WorkflowContext,
    };
    pub use contd_core::{SavepointNote, Variables, WorkflowState, WorkflowStatus};
}

// Re-export key types at crate root
pub use engine::{Engine, EngineConfig, EngineError, RunReport, StartRequest, StatusReport};
pub use journal::Journal;
pub use lease::{LeaseManager, StopReason};
pub use persistence::{DurableStore, InMemoryStore, PostgresStore, StoreError};
pub use recovery::{RecoveryEngine, Restored};
pub use reliability::RetryPolicy;
pub use runtime::{BodyFn, StepError, StepFailure, StepOptions, WorkflowBody, WorkflowContext};
pub use snapshots::SnapshotManager;
