//! Engine error taxonomy.
//!
//! Lifecycle and step errors are reported to the caller with the workflow
//! left intact; integrity errors fail closed; persistence errors surface
//! through the step-level retry policy; recovery errors block resume.

use thiserror::Error;

use duramen_types::error::StorageError;

/// Errors surfaced by the execution engine and command surface.
#[derive(Debug, Error)]
pub enum EngineError {
    // -- Lifecycle ----------------------------------------------------------
    /// Another executor holds a live lease for the workflow.
    #[error("workflow '{0}' is locked by another executor")]
    WorkflowLocked(String),

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    /// A workflow with this id already has journal history.
    #[error("workflow '{0}' already exists")]
    WorkflowAlreadyExists(String),

    /// The workflow already reached a terminal state.
    #[error("workflow '{0}' already completed")]
    WorkflowAlreadyCompleted(String),

    #[error("no active workflow")]
    NoActiveWorkflow,

    // -- Steps --------------------------------------------------------------
    #[error("step '{step_id}' timed out after {timeout_ms} ms")]
    StepTimeout { step_id: String, timeout_ms: u64 },

    #[error("step '{step_id}' exhausted {attempts} attempts")]
    TooManyAttempts { step_id: String, attempts: u32 },

    #[error("step '{step_id}' failed: {kind}: {message}")]
    StepExecutionFailed {
        step_id: String,
        kind: String,
        message: String,
    },

    /// The step observed cooperative cancellation and unwound.
    #[error("step '{0}' cancelled")]
    StepCancelled(String),

    // -- Integrity (fatal; fail closed) -------------------------------------
    #[error("checksum mismatch for {scope}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        scope: String,
        expected: String,
        actual: String,
    },

    #[error("event sequence gap in '{workflow_id}': expected {expected}, found {found}")]
    EventSequenceGap {
        workflow_id: String,
        expected: u64,
        found: u64,
    },

    #[error("snapshot '{0}' corrupted")]
    SnapshotCorrupted(String),

    // -- Leases -------------------------------------------------------------
    /// The executor's fencing token is no longer current; it must stop.
    #[error("lease for '{0}' lost to another executor")]
    LeaseLost(String),

    // -- Recovery -----------------------------------------------------------
    #[error("recovery failed for '{workflow_id}': {reason}")]
    RecoveryFailed { workflow_id: String, reason: String },

    #[error("invalid savepoint '{0}'")]
    InvalidSavepoint(String),

    // -- Configuration ------------------------------------------------------
    #[error("invalid configuration: {0}")]
    Config(String),

    // -- Persistence --------------------------------------------------------
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    /// Whether this error is a fatal integrity violation (no best-effort
    /// recovery is permitted).
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            EngineError::ChecksumMismatch { .. }
                | EngineError::EventSequenceGap { .. }
                | EngineError::SnapshotCorrupted(_)
        ) || matches!(self, EngineError::Storage(StorageError::Corrupt(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_classification() {
        assert!(EngineError::SnapshotCorrupted("s1".to_string()).is_integrity());
        assert!(
            EngineError::EventSequenceGap {
                workflow_id: "wf".to_string(),
                expected: 3,
                found: 5
            }
            .is_integrity()
        );
        assert!(EngineError::Storage(StorageError::Corrupt("x".to_string())).is_integrity());
        assert!(!EngineError::WorkflowLocked("wf".to_string()).is_integrity());
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::TooManyAttempts {
            step_id: "fetch_0".to_string(),
            attempts: 3,
        };
        assert_eq!(err.to_string(), "step 'fetch_0' exhausted 3 attempts");

        let err = EngineError::Storage(StorageError::NotFound);
        assert_eq!(err.to_string(), "record not found");
    }
}
