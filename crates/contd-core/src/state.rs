//! Checksummed workflow state

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::checksum_hex;
use crate::delta::{DeltaError, StateDelta};
use crate::error::IntegrityError;

/// Variable map carried by a workflow state
pub type Variables = serde_json::Map<String, Value>;

/// Current schema version for persisted states
pub const STATE_VERSION: u32 = 1;

/// Derived workflow lifecycle status
///
/// Status is never stored as a column; it is computed from the event
/// journal (and the lease table for `Running`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// No events recorded yet
    Pending,

    /// A live lease exists; an executor is driving the workflow
    Running,

    /// Progress recorded but no live lease and no terminal event
    Suspended,

    /// Terminal: workflow_completed recorded
    Completed,

    /// Terminal: last step failed with its retry budget exhausted
    Failed,

    /// Terminal: workflow_cancelled recorded
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The state of a workflow at a point in its history
///
/// The checksum is authoritative: every mutation must go through a method
/// that reseals the state before it is persisted or compared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub org_id: String,

    /// Number of completed steps
    pub step_number: u64,

    pub variables: Variables,

    /// Workflow name, start time, tags
    pub metadata: Variables,

    /// State schema version
    pub version: u32,

    /// SHA-256 over the canonical encoding of every other field
    pub checksum: String,
}

impl WorkflowState {
    /// Fresh state for a newly started workflow.
    ///
    /// `variables` starts as the caller's input mapping; `metadata` records
    /// the workflow name, start time, and tags.
    pub fn initial(
        workflow_id: impl Into<String>,
        org_id: impl Into<String>,
        workflow_name: &str,
        input: Variables,
        tags: Variables,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let mut metadata = Variables::new();
        metadata.insert("workflow_name".to_string(), Value::from(workflow_name));
        metadata.insert(
            "started_at".to_string(),
            Value::from(started_at.to_rfc3339()),
        );
        metadata.insert("tags".to_string(), Value::Object(tags));

        let mut state = Self {
            workflow_id: workflow_id.into(),
            org_id: org_id.into(),
            step_number: 0,
            variables: input,
            metadata,
            version: STATE_VERSION,
            checksum: String::new(),
        };
        state.seal();
        state
    }

    /// Canonical checksum over every field except `checksum` itself.
    pub fn compute_checksum(&self) -> String {
        let value = serde_json::json!({
            "workflow_id": self.workflow_id,
            "org_id": self.org_id,
            "step_number": self.step_number,
            "variables": self.variables,
            "metadata": self.metadata,
            "version": self.version,
        });
        checksum_hex(&value)
    }

    /// Recompute and store the checksum. Call after any mutation.
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Verify the stored checksum against the current content.
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(IntegrityError::checksum_mismatch(
                format!("workflow state {}", self.workflow_id),
                self.checksum.clone(),
                computed,
            ));
        }
        Ok(())
    }

    /// Apply a completed step: merge the delta, bump the step counter,
    /// and reseal.
    pub fn apply_completion(&mut self, delta: &StateDelta) -> Result<(), DeltaError> {
        delta.apply(&mut self.variables)?;
        self.step_number += 1;
        self.seal();
        Ok(())
    }

    /// The workflow name recorded at start, if present.
    pub fn workflow_name(&self) -> Option<&str> {
        self.metadata.get("workflow_name").and_then(Value::as_str)
    }

    /// Approximate serialized size, used for the snapshot inline threshold.
    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn test_state() -> WorkflowState {
        let mut input = Variables::new();
        input.insert("x".to_string(), json!(1));
        WorkflowState::initial("wf-1", "org-1", "order_flow", input, Variables::new(), Utc::now())
    }

    #[test]
    fn test_initial_state_is_sealed() {
        let state = test_state();
        assert_eq!(state.step_number, 0);
        assert_eq!(state.workflow_name(), Some("order_flow"));
        state.verify_integrity().unwrap();
    }

    #[test]
    fn test_mutation_without_seal_is_detected() {
        let mut state = test_state();
        state.variables.insert("y".to_string(), json!(2));
        assert!(state.verify_integrity().is_err());
        state.seal();
        state.verify_integrity().unwrap();
    }

    #[test]
    fn test_apply_completion_advances_and_reseals() {
        let mut state = test_state();
        let mut next = state.variables.clone();
        next.insert("y".to_string(), json!(2));
        let delta = StateDelta::between(&state.variables, &next);

        state.apply_completion(&delta).unwrap();
        assert_eq!(state.step_number, 1);
        assert_eq!(state.variables.get("y"), Some(&json!(2)));
        state.verify_integrity().unwrap();
    }

    #[test]
    fn test_checksum_excludes_itself() {
        let mut state = test_state();
        let before = state.compute_checksum();
        state.checksum = "garbage".to_string();
        assert_eq!(state.compute_checksum(), before);
    }

    #[test]
    fn test_status_terminality() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Suspended.is_terminal());
        assert_eq!(WorkflowStatus::Suspended.to_string(), "suspended");
    }
}
