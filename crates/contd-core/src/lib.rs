//! # Contd Core
//!
//! Data model for the contd durable execution engine.
//!
//! Everything in this crate is storage-agnostic and synchronous: canonical
//! JSON encoding with SHA-256 checksums, the append-only event model,
//! checksummed workflow state with deterministic deltas, snapshots, leases,
//! and the per-step attempt/completion records. The execution engine and
//! its persistence backends live in `contd-durable`.

pub mod codec;
pub mod delta;
pub mod error;
pub mod event;
pub mod lease;
pub mod savepoint;
pub mod snapshot;
pub mod state;
pub mod step;

pub use codec::{checksum_bytes, checksum_hex, to_canonical_json, verify_checksum};
pub use delta::{DeltaEntry, DeltaError, StateDelta};
pub use error::IntegrityError;
pub use event::{Event, EventPayload, EventType, PRODUCER_VERSION, SCHEMA_VERSION};
pub use lease::Lease;
pub use savepoint::{Savepoint, SavepointNote};
pub use snapshot::{Snapshot, SnapshotState, DEFAULT_INLINE_THRESHOLD};
pub use state::{Variables, WorkflowState, WorkflowStatus};
pub use step::{CompletedStep, StepAttempt};
