//! Deterministic state deltas
//!
//! A `StateDelta` is the canonical representation of the transformation
//! from one state's variables to the next: add/replace/remove entries,
//! ordered lexicographically by key so that identical logical changes
//! always encode (and checksum) identically.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::Variables;

/// Error applying a delta to a variable map.
///
/// A delta is only valid against the exact variables it was computed from;
/// a mismatch means the journal and the state have diverged.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("delta adds key {0} which is already present")]
    AddOnExisting(String),

    #[error("delta replaces key {0} which is absent")]
    ReplaceOnMissing(String),

    #[error("delta removes key {0} which is absent")]
    RemoveOnMissing(String),
}

/// A single variable change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaEntry {
    Add { key: String, value: Value },
    Replace { key: String, value: Value },
    Remove { key: String },
}

impl DeltaEntry {
    pub fn key(&self) -> &str {
        match self {
            Self::Add { key, .. } | Self::Replace { key, .. } | Self::Remove { key } => key,
        }
    }
}

/// An ordered set of variable changes between two states
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateDelta {
    pub entries: Vec<DeltaEntry>,
}

impl StateDelta {
    /// Compute the delta that transforms `old` into `new`.
    ///
    /// At most one entry is produced per key, and entries come out sorted
    /// by key, so the encoding is deterministic.
    pub fn between(old: &Variables, new: &Variables) -> Self {
        let mut entries = Vec::new();

        for (key, new_value) in new {
            match old.get(key) {
                None => entries.push(DeltaEntry::Add {
                    key: key.clone(),
                    value: new_value.clone(),
                }),
                Some(old_value) if old_value != new_value => {
                    entries.push(DeltaEntry::Replace {
                        key: key.clone(),
                        value: new_value.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        for key in old.keys() {
            if !new.contains_key(key) {
                entries.push(DeltaEntry::Remove { key: key.clone() });
            }
        }

        entries.sort_by(|a, b| a.key().cmp(b.key()));
        Self { entries }
    }

    /// Apply this delta in place.
    ///
    /// Strict: an entry that does not match the current shape of
    /// `variables` is an error, never a silent merge.
    pub fn apply(&self, variables: &mut Variables) -> Result<(), DeltaError> {
        for entry in &self.entries {
            match entry {
                DeltaEntry::Add { key, value } => {
                    if variables.contains_key(key) {
                        return Err(DeltaError::AddOnExisting(key.clone()));
                    }
                    variables.insert(key.clone(), value.clone());
                }
                DeltaEntry::Replace { key, value } => {
                    if !variables.contains_key(key) {
                        return Err(DeltaError::ReplaceOnMissing(key.clone()));
                    }
                    variables.insert(key.clone(), value.clone());
                }
                DeltaEntry::Remove { key } => {
                    if variables.remove(key).is_none() {
                        return Err(DeltaError::RemoveOnMissing(key.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
