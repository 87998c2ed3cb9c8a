//! Journal events: the immutable, integrity-stamped records that make a
//! workflow's history.
//!
//! Every state change is an `Event` with a per-workflow monotonic
//! `event_seq` (starting at 1, no gaps) and a SHA-256 checksum over the
//! canonical encoding of all other fields. The journal assigns `event_seq`
//! and `checksum` at append time; the engine constructs events with both
//! unset via [`Event::new`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::StateDelta;

/// Event schema version stamped into new events.
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// The closed set of journal event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StepIntention,
    StepCompleted,
    StepFailed,
    SavepointCreated,
    WorkflowCompleted,
    WorkflowCancelled,
}

impl EventType {
    /// Stable string form, used as the `event_type` column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StepIntention => "step_intention",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::SavepointCreated => "savepoint_created",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowCancelled => "workflow_cancelled",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "step_intention" => Some(EventType::StepIntention),
            "step_completed" => Some(EventType::StepCompleted),
            "step_failed" => Some(EventType::StepFailed),
            "savepoint_created" => Some(EventType::SavepointCreated),
            "workflow_completed" => Some(EventType::WorkflowCompleted),
            "workflow_cancelled" => Some(EventType::WorkflowCancelled),
            _ => None,
        }
    }

    /// Whether events of this type end the workflow's history.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::WorkflowCompleted | EventType::WorkflowCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Payload of a `step_intention` event, written before the user function
/// runs so a crash mid-step is visible on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepIntentionPayload {
    pub step_id: String,
    pub step_name: String,
    pub attempt_id: u32,
    pub fencing_token: u64,
}

/// Payload of a `step_completed` event: the step's durable commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub step_id: String,
    pub attempt_id: u32,
    pub state_delta: StateDelta,
    /// Checksum of the workflow state after applying `state_delta`.
    pub new_state_checksum: String,
    pub duration_ms: u64,
}

/// Payload of a `step_failed` event, one per failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedPayload {
    pub step_id: String,
    pub attempt_id: u32,
    pub error_kind: String,
    pub error_message: String,
}

/// Payload of a `savepoint_created` event. Carries the epistemic metadata
/// that makes savepoints useful branch targets for agents and humans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavepointCreatedPayload {
    pub savepoint_id: Uuid,
    pub step_number: u64,
    pub goal_summary: String,
    pub hypotheses: Vec<String>,
    pub questions: Vec<String>,
    pub decisions: Vec<serde_json::Value>,
    pub next_step: String,
    /// Opaque reference to the snapshot active at this step.
    pub snapshot_ref: String,
}

/// Payload of a `workflow_completed` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCompletedPayload {
    pub final_state_checksum: String,
}

/// Payload of a `workflow_cancelled` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCancelledPayload {
    pub reason: String,
}

/// Type-specific event payload. The discriminant is stored in the journal's
/// `event_type` column rather than inside the payload JSON, so the payload
/// encodings match the fixed wire schemas exactly.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    StepIntention(StepIntentionPayload),
    StepCompleted(StepCompletedPayload),
    StepFailed(StepFailedPayload),
    SavepointCreated(SavepointCreatedPayload),
    WorkflowCompleted(WorkflowCompletedPayload),
    WorkflowCancelled(WorkflowCancelledPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::StepIntention(_) => EventType::StepIntention,
            EventPayload::StepCompleted(_) => EventType::StepCompleted,
            EventPayload::StepFailed(_) => EventType::StepFailed,
            EventPayload::SavepointCreated(_) => EventType::SavepointCreated,
            EventPayload::WorkflowCompleted(_) => EventType::WorkflowCompleted,
            EventPayload::WorkflowCancelled(_) => EventType::WorkflowCancelled,
        }
    }

    /// Serialize the payload fields (no type tag) to a JSON value.
    pub fn to_value(&self) -> serde_json::Value {
        // Payload structs contain only JSON-representable fields, so
        // serialization cannot fail.
        let result = match self {
            EventPayload::StepIntention(p) => serde_json::to_value(p),
            EventPayload::StepCompleted(p) => serde_json::to_value(p),
            EventPayload::StepFailed(p) => serde_json::to_value(p),
            EventPayload::SavepointCreated(p) => serde_json::to_value(p),
            EventPayload::WorkflowCompleted(p) => serde_json::to_value(p),
            EventPayload::WorkflowCancelled(p) => serde_json::to_value(p),
        };
        result.unwrap_or(serde_json::Value::Null)
    }

    /// Reconstruct a payload from its stored `event_type` and JSON value.
    pub fn from_value(
        event_type: EventType,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match event_type {
            EventType::StepIntention => {
                EventPayload::StepIntention(serde_json::from_value(value)?)
            }
            EventType::StepCompleted => {
                EventPayload::StepCompleted(serde_json::from_value(value)?)
            }
            EventType::StepFailed => EventPayload::StepFailed(serde_json::from_value(value)?),
            EventType::SavepointCreated => {
                EventPayload::SavepointCreated(serde_json::from_value(value)?)
            }
            EventType::WorkflowCompleted => {
                EventPayload::WorkflowCompleted(serde_json::from_value(value)?)
            }
            EventType::WorkflowCancelled => {
                EventPayload::WorkflowCancelled(serde_json::from_value(value)?)
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One immutable journal record.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Globally unique event id.
    pub event_id: Uuid,
    pub workflow_id: String,
    pub org_id: String,
    /// Monotonic per-workflow sequence, starting at 1. Zero until the
    /// journal assigns it at append time.
    pub event_seq: u64,
    pub payload: EventPayload,
    /// Wall clock, for humans only. Never used for ordering.
    pub timestamp: DateTime<Utc>,
    pub schema_version: String,
    /// Version of the producing engine build.
    pub producer_version: String,
    /// SHA-256 (lowercase hex) over the canonical encoding of all other
    /// fields. Empty until the journal assigns it at append time.
    pub checksum: String,
}

impl Event {
    /// Construct a new, not-yet-appended event. The timestamp is truncated
    /// to microseconds so its canonical encoding round-trips through
    /// storage byte-for-byte.
    pub fn new(
        workflow_id: impl Into<String>,
        org_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        let now = Utc::now();
        let timestamp = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
        Self {
            event_id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            org_id: org_id.into(),
            event_seq: 0,
            payload,
            timestamp,
            schema_version: EVENT_SCHEMA_VERSION.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            checksum: String::new(),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
