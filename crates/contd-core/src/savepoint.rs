//! Savepoints
//!
//! A savepoint is an application-visible marker event referencing the
//! snapshot active at that step. Its metadata describes the workflow's
//! state of understanding at that point and makes the savepoint an
//! addressable target for branching (time travel).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventPayload;

/// Caller-supplied savepoint metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavepointNote {
    /// What the workflow is trying to achieve right now
    pub goal_summary: String,

    pub hypotheses: Vec<String>,
    pub questions: Vec<String>,

    /// Decisions taken so far, most recent last
    pub decisions: Vec<String>,

    /// Label for the intended next step
    pub next_step: String,
}

impl SavepointNote {
    pub fn new(goal_summary: impl Into<String>) -> Self {
        Self {
            goal_summary: goal_summary.into(),
            ..Default::default()
        }
    }

    pub fn with_next_step(mut self, next_step: impl Into<String>) -> Self {
        self.next_step = next_step.into();
        self
    }

    pub fn with_hypothesis(mut self, hypothesis: impl Into<String>) -> Self {
        self.hypotheses.push(hypothesis.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.questions.push(question.into());
        self
    }

    pub fn with_decision(mut self, decision: impl Into<String>) -> Self {
        self.decisions.push(decision.into());
        self
    }

    /// Build the journal payload for this note.
    pub fn into_payload(
        self,
        savepoint_id: Uuid,
        step_number: u64,
        snapshot_ref: Uuid,
    ) -> EventPayload {
        EventPayload::SavepointCreated {
            savepoint_id,
            step_number,
            goal_summary: self.goal_summary,
            hypotheses: self.hypotheses,
            questions: self.questions,
            decisions: self.decisions,
            next_step: self.next_step,
            snapshot_ref,
        }
    }
}

/// A savepoint as listed back to callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Savepoint {
    pub savepoint_id: Uuid,
    pub workflow_id: String,
    pub step_number: u64,
    pub note: SavepointNote,
    pub snapshot_ref: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Savepoint {
    /// Rebuild a savepoint view from its journal payload, if it is one.
    pub fn from_payload(
        workflow_id: &str,
        created_at: DateTime<Utc>,
        payload: &EventPayload,
    ) -> Option<Self> {
        match payload {
            EventPayload::SavepointCreated {
                savepoint_id,
                step_number,
                goal_summary,
                hypotheses,
                questions,
                decisions,
                next_step,
                snapshot_ref,
            } => Some(Self {
                savepoint_id: *savepoint_id,
                workflow_id: workflow_id.to_string(),
                step_number: *step_number,
                note: SavepointNote {
                    goal_summary: goal_summary.clone(),
                    hypotheses: hypotheses.clone(),
                    questions: questions.clone(),
                    decisions: decisions.clone(),
                    next_step: next_step.clone(),
                },
                snapshot_ref: *snapshot_ref,
                created_at,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_builder() {
        let note = SavepointNote::new("rank candidate fixes")
            .with_hypothesis("flakiness is timing-related")
            .with_question("does the retry mask the root cause?")
            .with_decision("pin the clock in tests")
            .with_next_step("rerun the suite");

        assert_eq!(note.goal_summary, "rank candidate fixes");
        assert_eq!(note.hypotheses.len(), 1);
        assert_eq!(note.next_step, "rerun the suite");
    }

    #[test]
    fn test_payload_round_trip() {
        let note = SavepointNote::new("goal").with_next_step("next");
        let sp_id = Uuid::now_v7();
        let snap_id = Uuid::now_v7();
        let payload = note.clone().into_payload(sp_id, 3, snap_id);

        let view = Savepoint::from_payload("wf-1", Utc::now(), &payload).unwrap();
        assert_eq!(view.savepoint_id, sp_id);
        assert_eq!(view.snapshot_ref, snap_id);
        assert_eq!(view.step_number, 3);
        assert_eq!(view.note, note);
    }

    #[test]
    fn test_from_payload_rejects_other_events() {
        let payload = EventPayload::WorkflowCancelled {
            reason: "nope".to_string(),
        };
        assert!(Savepoint::from_payload("wf-1", Utc::now(), &payload).is_none());
    }
}
