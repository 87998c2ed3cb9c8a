//! Workflow leases: time-bounded exclusive execution rights.
//!
//! At most one lease exists per `workflow_id` at any time. Each acquisition
//! increments the `fencing_token`, a strictly increasing integer that lets
//! stores and the runtime reject writes from executors that lost their
//! lease to a takeover.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A held (or observed) lease row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub workflow_id: String,
    pub org_id: String,
    /// Executor identity, e.g. `exec-<uuid>`.
    pub owner_id: String,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    /// Strictly increases across the workflow's lease history.
    pub fencing_token: u64,
}

impl Lease {
    /// Whether the lease is still live at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lease_liveness() {
        let now = Utc::now();
        let lease = Lease {
            workflow_id: "wf-1".to_string(),
            org_id: "default".to_string(),
            owner_id: "exec-a".to_string(),
            acquired_at: now,
            lease_expires_at: now + Duration::seconds(30),
            heartbeat_at: now,
            fencing_token: 1,
        };
        assert!(lease.is_live(now));
        assert!(!lease.is_live(now + Duration::seconds(31)));
    }
}
