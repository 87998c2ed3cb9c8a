//! Workflow state: the variable map a workflow accumulates step by step.
//!
//! State is never stored as a mutable row; it is reconstructed from the
//! event journal (optionally seeded by a snapshot). The `checksum` field is
//! authoritative: any mutation must recompute it before the state is
//! persisted or compared. Checksum computation lives in `duramen-core`'s
//! canonical codec so that this crate stays free of hashing dependencies.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The variable map carried by a workflow state. Keys are user-defined;
/// keys with a leading underscore are reserved for the engine
/// (e.g. `_savepoint_metadata`).
pub type Variables = serde_json::Map<String, serde_json::Value>;

/// Current schema version written into new states and events.
pub const STATE_SCHEMA_VERSION: &str = "1.0";

/// Default tenant identifier when the caller does not supply one.
pub const DEFAULT_ORG_ID: &str = "default";

/// A workflow's full state at some point in its history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    /// Opaque workflow identifier, unique within `org_id`.
    pub workflow_id: String,
    /// Number of completed steps reflected in `variables`.
    pub step_number: u64,
    /// User variables accumulated by completed steps.
    pub variables: Variables,
    /// Engine metadata: workflow name, start time, tags.
    pub metadata: Variables,
    /// State schema version.
    pub version: String,
    /// SHA-256 (lowercase hex) over the canonical encoding of every other
    /// field. Empty until sealed by the canonical codec.
    pub checksum: String,
    /// Tenant identifier. Opaque to the core.
    pub org_id: String,
}

impl WorkflowState {
    /// Build the initial (step zero) state for a new workflow. The checksum
    /// is left empty; the engine seals it before first use.
    pub fn initial(
        workflow_id: impl Into<String>,
        workflow_name: &str,
        org_id: impl Into<String>,
        started_at: DateTime<Utc>,
        tags: &HashMap<String, String>,
    ) -> Self {
        let mut metadata = Variables::new();
        metadata.insert("workflow_name".to_string(), workflow_name.into());
        metadata.insert(
            "started_at".to_string(),
            started_at
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .into(),
        );
        metadata.insert(
            "tags".to_string(),
            serde_json::Value::Object(
                tags.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect(),
            ),
        );

        Self {
            workflow_id: workflow_id.into(),
            step_number: 0,
            variables: Variables::new(),
            metadata,
            version: STATE_SCHEMA_VERSION.to_string(),
            checksum: String::new(),
            org_id: org_id.into(),
        }
    }

    /// Build a fully empty state (no variables, no metadata) for a
    /// workflow. This is the deterministic genesis base used when replay
    /// must start without any snapshot.
    pub fn empty(workflow_id: impl Into<String>, org_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            step_number: 0,
            variables: Variables::new(),
            metadata: Variables::new(),
            version: STATE_SCHEMA_VERSION.to_string(),
            checksum: String::new(),
            org_id: org_id.into(),
        }
    }

    /// Name of the workflow as recorded in metadata, if present.
    pub fn workflow_name(&self) -> Option<&str> {
        self.metadata.get("workflow_name").and_then(|v| v.as_str())
    }
}
