//! Savepoints: application-visible markers that pair a snapshot reference
//! with metadata describing the workflow's state of understanding --
//! goal, hypotheses, open questions, decision log, and next step. They are
//! the addressable targets for time-travel branching.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::SavepointCreatedPayload;
use crate::state::Variables;

/// Reserved variable key a step may set to attach metadata to the
/// savepoint it requests.
pub const SAVEPOINT_METADATA_KEY: &str = "_savepoint_metadata";

/// Metadata attached to a savepoint by the workflow author.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SavepointMetadata {
    #[serde(default)]
    pub goal_summary: String,
    #[serde(default)]
    pub hypotheses: Vec<String>,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<serde_json::Value>,
    #[serde(default)]
    pub next_step: String,
}

impl SavepointMetadata {
    /// Extract metadata from the reserved `_savepoint_metadata` variable,
    /// falling back to empty metadata when absent or malformed.
    pub fn from_variables(variables: &Variables) -> Self {
        variables
            .get(SAVEPOINT_METADATA_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

/// A savepoint as surfaced by the command layer, reconstructed from its
/// `savepoint_created` journal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Savepoint {
    pub savepoint_id: Uuid,
    pub workflow_id: String,
    pub step_number: u64,
    pub goal_summary: String,
    pub hypotheses: Vec<String>,
    pub questions: Vec<String>,
    pub decisions: Vec<serde_json::Value>,
    pub next_step: String,
    /// Opaque reference to the snapshot active at this savepoint.
    pub snapshot_ref: String,
    pub created_at: DateTime<Utc>,
}

impl Savepoint {
    /// Build a savepoint view from a journal event payload.
    pub fn from_payload(
        workflow_id: &str,
        payload: &SavepointCreatedPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            savepoint_id: payload.savepoint_id,
            workflow_id: workflow_id.to_string(),
            step_number: payload.step_number,
            goal_summary: payload.goal_summary.clone(),
            hypotheses: payload.hypotheses.clone(),
            questions: payload.questions.clone(),
            decisions: payload.decisions.clone(),
            next_step: payload.next_step.clone(),
            snapshot_ref: payload.snapshot_ref.clone(),
            created_at,
        }
    }
}
