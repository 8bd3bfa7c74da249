//! Executor leases
//!
//! A lease is a time-bounded exclusive right to execute one workflow.
//! The fencing token strictly increases across the workflow's history, so
//! writes from an evicted owner can always be told apart from the current
//! owner's.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A lease row, keyed by workflow_id
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub workflow_id: String,

    /// Executor identity holding the lease
    pub owner_id: String,

    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,

    /// Strictly increasing across acquisitions of this workflow
    pub fencing_token: i64,
}

impl Lease {
    /// Build a fresh lease for an acquisition at `now`.
    pub fn granted(
        workflow_id: impl Into<String>,
        owner_id: impl Into<String>,
        fencing_token: i64,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let ttl = Duration::from_std(ttl).unwrap_or(Duration::seconds(30));
        Self {
            workflow_id: workflow_id.into(),
            owner_id: owner_id.into(),
            acquired_at: now,
            lease_expires_at: now + ttl,
            heartbeat_at: now,
            fencing_token,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }

    /// The three-way identity used for compare-and-set operations.
    pub fn key(&self) -> (&str, &str, i64) {
        (&self.workflow_id, &self.owner_id, self.fencing_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    #[test]
    fn test_granted_lease_window() {
        let now = Utc::now();
        let lease = Lease::granted("wf-1", "exec-a", 1, StdDuration::from_secs(30), now);

        assert!(!lease.is_expired(now));
        assert!(!lease.is_expired(now + Duration::seconds(29)));
        assert!(lease.is_expired(now + Duration::seconds(30)));
        assert_eq!(lease.key(), ("wf-1", "exec-a", 1));
    }
}
