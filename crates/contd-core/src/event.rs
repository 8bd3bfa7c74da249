//! Journal events
//!
//! Events form the append-only log for a workflow: per-workflow monotonic
//! `event_seq` starting at 1 with no gaps, and a SHA-256 checksum over the
//! canonical encoding of every other field. Events are immutable once
//! written; workflow state is reconstructed by replaying them in sequence
//! order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::codec::checksum_hex;
use crate::delta::StateDelta;
use crate::error::IntegrityError;

/// Payload schema version stamped on every event
pub const SCHEMA_VERSION: u32 = 1;

/// Version of the code that produced an event
pub const PRODUCER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Closed set of event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StepIntention,
    StepCompleted,
    StepFailed,
    SavepointCreated,
    WorkflowCompleted,
    WorkflowCancelled,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StepIntention => "step_intention",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::SavepointCreated => "savepoint_created",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowCancelled => "workflow_cancelled",
        };
        write!(f, "{name}")
    }
}

/// Type-specific event payloads
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A step is about to execute. Written before any side effect.
    StepIntention {
        step_id: String,
        step_name: String,
        attempt_id: u32,
        fencing_token: i64,
    },

    /// A step committed. Carries the delta that advances the state.
    StepCompleted {
        step_id: String,
        attempt_id: u32,
        state_delta: StateDelta,
        new_state_checksum: String,
        duration_ms: u64,
    },

    /// An attempt failed; a retry may follow.
    StepFailed {
        step_id: String,
        attempt_id: u32,
        error_kind: String,
        error_message: String,
    },

    /// An addressable marker referencing the snapshot active at this step.
    SavepointCreated {
        savepoint_id: Uuid,
        step_number: u64,
        goal_summary: String,
        hypotheses: Vec<String>,
        questions: Vec<String>,
        decisions: Vec<String>,
        next_step: String,
        snapshot_ref: Uuid,
    },

    /// Terminal: the workflow body returned successfully.
    WorkflowCompleted { final_state_checksum: String },

    /// Terminal: the workflow was cancelled externally.
    WorkflowCancelled { reason: String },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::StepIntention { .. } => EventType::StepIntention,
            Self::StepCompleted { .. } => EventType::StepCompleted,
            Self::StepFailed { .. } => EventType::StepFailed,
            Self::SavepointCreated { .. } => EventType::SavepointCreated,
            Self::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            Self::WorkflowCancelled { .. } => EventType::WorkflowCancelled,
        }
    }

    /// Get the step_id if this is a step-related payload
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::StepIntention { step_id, .. }
            | Self::StepCompleted { step_id, .. }
            | Self::StepFailed { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// Check if this payload ends the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowCancelled { .. }
        )
    }
}

/// An immutable journal record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Globally unique id
    pub event_id: Uuid,

    pub workflow_id: String,
    pub org_id: String,

    /// Monotonic per workflow, starting at 1, no gaps.
    /// Zero until the journal assigns it at append time.
    pub event_seq: i64,

    pub payload: EventPayload,

    /// Wall clock, for humans only; ordering uses event_seq
    pub timestamp: DateTime<Utc>,

    pub schema_version: u32,
    pub producer_version: String,

    /// SHA-256 over the canonical encoding of all other fields
    pub checksum: String,
}

impl Event {
    /// Build an event awaiting sequence assignment.
    ///
    /// The checksum is stamped when the journal assigns the sequence; until
    /// then it is empty and the event must not be persisted.
    pub fn new(
        workflow_id: impl Into<String>,
        org_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            org_id: org_id.into(),
            event_seq: 0,
            payload,
            timestamp: Utc::now(),
            schema_version: SCHEMA_VERSION,
            producer_version: PRODUCER_VERSION.to_string(),
            checksum: String::new(),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Assign the journal sequence and stamp the checksum.
    pub fn assign_seq(mut self, seq: i64) -> Self {
        self.event_seq = seq;
        self.checksum = self.compute_checksum();
        self
    }

    /// Canonical checksum over every field except `checksum` itself.
    pub fn compute_checksum(&self) -> String {
        let value = serde_json::json!({
            "event_id": self.event_id,
            "workflow_id": self.workflow_id,
            "org_id": self.org_id,
            "event_seq": self.event_seq,
            "payload": payload_value(&self.payload),
            "timestamp": self.timestamp.to_rfc3339(),
            "schema_version": self.schema_version,
            "producer_version": self.producer_version,
        });
        checksum_hex(&value)
    }

    /// Verify the stored checksum against the current content.
    pub fn verify_checksum(&self) -> Result<(), IntegrityError> {
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(IntegrityError::checksum_mismatch(
                format!("event {} (seq {})", self.event_id, self.event_seq),
                self.checksum.clone(),
                computed,
            ));
        }
        Ok(())
    }
}

fn payload_value(payload: &EventPayload) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}
