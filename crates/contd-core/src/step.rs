//! Step attempt and completion records
//!
//! These rows back the idempotency table: attempts are allocated per
//! execution try, and at most one completion exists per
//! `(workflow_id, step_id)`. A completion is the authoritative result of
//! the step on any replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::checksum_hex;
use crate::error::IntegrityError;

/// One execution try of a logical step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepAttempt {
    pub workflow_id: String,

    /// Deterministic per logical occurrence: `{step_name}_{counter}`
    pub step_id: String,

    /// 1-based; increments when a prior attempt failed or its lease expired
    pub attempt_id: u32,

    pub started_at: DateTime<Utc>,

    /// Token of the lease under which this attempt runs
    pub fencing_token: i64,
}

/// The durable commit of a step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletedStep {
    pub workflow_id: String,
    pub step_id: String,

    /// The attempt that won
    pub attempt_id: u32,

    pub completed_at: DateTime<Utc>,

    /// The step function's recorded result, returned verbatim on replay
    pub result: Value,

    /// Checksum of the canonical encoding of `result`
    pub result_checksum: String,
}

impl CompletedStep {
    /// Record a completion, stamping the result checksum.
    pub fn record(
        workflow_id: impl Into<String>,
        step_id: impl Into<String>,
        attempt_id: u32,
        result: Value,
    ) -> Self {
        let result_checksum = checksum_hex(&result);
        Self {
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            attempt_id,
            completed_at: Utc::now(),
            result,
            result_checksum,
        }
    }

    /// Verify the stored result against its checksum.
    pub fn verify_result(&self) -> Result<(), IntegrityError> {
        let computed = checksum_hex(&self.result);
        if computed != self.result_checksum {
            return Err(IntegrityError::checksum_mismatch(
                format!("completed step {} of {}", self.step_id, self.workflow_id),
                self.result_checksum.clone(),
                computed,
            ));
        }
        Ok(())
    }
}

/// Compose the deterministic step id for the Nth step invocation.
pub fn step_id(step_name: &str, invocation: u64) -> String {
    format!("{step_name}_{invocation}")
}
