//! Snapshots: persisted workflow-state blobs stamped with the highest
//! event sequence they cover.
//!
//! Snapshots are strictly an optimization for restore; the event journal
//! remains the source of truth. They are immutable once written, and
//! restore authoritatively trusts them up to `last_event_seq`. Storage
//! backends may spill the state to an external blob store when it exceeds
//! the inline threshold; readers always get the state resolved and
//! checksum-verified.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::WorkflowState;

/// Default threshold above which a serialized state is written to external
/// blob storage instead of inline (100 KiB).
pub const DEFAULT_INLINE_THRESHOLD: usize = 100 * 1024;

/// A point-in-time capture of a workflow's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: Uuid,
    pub workflow_id: String,
    pub org_id: String,
    /// Completed steps reflected in `state`.
    pub step_number: u64,
    /// Highest journal sequence covered by `state`. Restore replays only
    /// events with a greater sequence.
    pub last_event_seq: u64,
    /// The captured state, resolved inline regardless of how the backend
    /// stored it.
    pub state: WorkflowState,
    /// SHA-256 (lowercase hex) over the canonical serialization of `state`,
    /// verified on every read.
    pub state_checksum: String,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Capture `state` as a new snapshot covering events up to
    /// `last_event_seq`. The `state_checksum` is left empty; the engine
    /// seals it via the canonical codec before handing the snapshot to a
    /// store.
    pub fn capture(state: WorkflowState, last_event_seq: u64) -> Self {
        Self {
            snapshot_id: Uuid::now_v7(),
            workflow_id: state.workflow_id.clone(),
            org_id: state.org_id.clone(),
            step_number: state.step_number,
            last_event_seq,
            state,
            state_checksum: String::new(),
            created_at: Utc::now(),
        }
    }
}
