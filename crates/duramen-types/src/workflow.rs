//! Workflow-level types: derived lifecycle status, start options, and the
//! reports returned by the command surface.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::lease::Lease;
use crate::savepoint::Savepoint;
use crate::state::{Variables, WorkflowState};
use crate::step::RetryPolicy;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Derived lifecycle state of a workflow. Never stored as a column; always
/// computed from the event journal and the lease table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Start options
// ---------------------------------------------------------------------------

/// Configuration accepted when starting a workflow.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Explicit workflow id; auto-generated (`wf-<uuid>`) when absent.
    pub workflow_id: Option<String>,
    pub workflow_name: String,
    /// Input mapping, recorded under the `input` variable of the initial
    /// state.
    pub input: Variables,
    pub tags: HashMap<String, String>,
    /// Tenant identifier; opaque to the core.
    pub org_id: Option<String>,
    /// Default retry policy for steps that do not override it.
    pub retry_policy: Option<RetryPolicy>,
}

impl StartOptions {
    pub fn new(workflow_name: impl Into<String>) -> Self {
        Self {
            workflow_id: None,
            workflow_name: workflow_name.into(),
            input: Variables::new(),
            tags: HashMap::new(),
            org_id: None,
            retry_policy: None,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_input(mut self, input: Variables) -> Self {
        self.input = input;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of running (or resuming) a workflow body to its end.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub state: WorkflowState,
}

/// Status report returned by the `Status` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub step_number: u64,
    /// The current lease row, live or expired, if one exists.
    pub lease: Option<Lease>,
    pub event_count: u64,
    pub snapshot_count: u64,
    pub savepoints: Vec<Savepoint>,
}
