//! Hybrid recovery: snapshot plus event replay into a validated state.
//!
//! Restore is a pure function of the journal and snapshot store and can
//! run against a read replica. Strategy:
//!
//! 1. Load the latest snapshot (authoritative up to its `last_event_seq`).
//! 2. Replay events with a greater sequence, in ascending order.
//! 3. Validate checksums at every step and fail closed on any mismatch,
//!    corrupted snapshot, or sequence gap -- a partial state is never
//!    returned.

use uuid::Uuid;

use duramen_types::delta::StateDelta;
use duramen_types::event::{Event, EventPayload};
use duramen_types::state::WorkflowState;
use duramen_types::workflow::WorkflowStatus;

use crate::codec;
use crate::error::EngineError;
use crate::store::{JournalStore, SnapshotStore};

/// The outcome of a validated restore.
#[derive(Debug, Clone)]
pub struct RestoredState {
    pub state: WorkflowState,
    /// Highest event sequence reflected in `state`.
    pub last_event_seq: u64,
    /// Terminal status recorded in the journal, if the workflow ended.
    pub terminal: Option<WorkflowStatus>,
    /// `step_intention` events seen during replay (observability only).
    pub intention_count: u64,
    /// `step_failed` events seen during replay (observability only).
    pub failure_count: u64,
}

/// One committed step the executing context must replay onto the base
/// state when its cached completion is adopted.
#[derive(Debug, Clone)]
pub(crate) struct ReplayStep {
    pub step_id: String,
    pub delta: StateDelta,
    pub new_state_checksum: String,
    pub event_seq: u64,
    pub event_id: Uuid,
    pub attempt_id: u32,
}

/// A restore decomposed for execution: the base state plus the committed
/// steps that lie beyond it. Applying every replay step to `base` yields
/// `restored.state`.
#[derive(Debug, Clone)]
pub(crate) struct RestorePlan {
    pub base: WorkflowState,
    pub replay: Vec<ReplayStep>,
    pub restored: RestoredState,
}

/// Recovery engine over a journal and snapshot store.
pub struct Recovery<'a, J, S> {
    journal: &'a J,
    snapshots: &'a S,
}

impl<'a, J, S> Recovery<'a, J, S>
where
    J: JournalStore,
    S: SnapshotStore,
{
    pub fn new(journal: &'a J, snapshots: &'a S) -> Self {
        Self { journal, snapshots }
    }

    /// Restore the workflow's current state.
    pub async fn restore(&self, workflow_id: &str) -> Result<RestoredState, EngineError> {
        Ok(self.plan_up_to(workflow_id, u64::MAX).await?.restored)
    }

    /// Restore the state as of `target_seq`, ignoring later events. Useful
    /// for debugging and for verifying snapshot coverage.
    pub async fn restore_to_point(
        &self,
        workflow_id: &str,
        target_seq: u64,
    ) -> Result<RestoredState, EngineError> {
        Ok(self.plan_up_to(workflow_id, target_seq).await?.restored)
    }

    /// Full restore decomposed into base + replay for the step runtime.
    pub(crate) async fn plan(&self, workflow_id: &str) -> Result<RestorePlan, EngineError> {
        self.plan_up_to(workflow_id, u64::MAX).await
    }

    async fn plan_up_to(
        &self,
        workflow_id: &str,
        target_seq: u64,
    ) -> Result<RestorePlan, EngineError> {
        // 1. Latest snapshot at or before the target.
        let snapshot = self.snapshots.get_latest(workflow_id, target_seq).await?;
        let (base, base_seq) = match snapshot {
            Some(snapshot) => {
                if !codec::verify_state(&snapshot.state) {
                    return Err(EngineError::SnapshotCorrupted(
                        snapshot.snapshot_id.to_string(),
                    ));
                }
                (snapshot.state, snapshot.last_event_seq)
            }
            None => (WorkflowState::empty(workflow_id, ""), 0),
        };

        // 2. Events beyond the snapshot, ascending.
        let events = self
            .journal
            .read_range(workflow_id, base_seq + 1, target_seq)
            .await?;

        if base_seq == 0 && base.checksum.is_empty() && events.is_empty() {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
        }

        // Seal the genesis base now that the tenant is known from the
        // journal (the empty state carries no org until events name one).
        let mut state = base;
        if state.checksum.is_empty() {
            if let Some(first) = events.first() {
                state.org_id = first.org_id.clone();
            }
            state.checksum = codec::state_checksum(&state);
        }
        let base_state = state.clone();

        // 3. Deterministic replay with integrity checks.
        let mut replay = Vec::new();
        let mut restored = RestoredState {
            state,
            last_event_seq: base_seq,
            terminal: None,
            intention_count: 0,
            failure_count: 0,
        };
        let mut last_completed_checksum: Option<String> = None;

        for event in &events {
            self.check_event(workflow_id, &restored, event)?;
            restored.last_event_seq = event.event_seq;

            match &event.payload {
                EventPayload::StepCompleted(payload) => {
                    payload.state_delta.apply(&mut restored.state.variables);
                    restored.state.step_number += 1;
                    restored.state.checksum = codec::state_checksum(&restored.state);
                    if restored.state.checksum != payload.new_state_checksum {
                        return Err(EngineError::ChecksumMismatch {
                            scope: format!("state after step '{}'", payload.step_id),
                            expected: payload.new_state_checksum.clone(),
                            actual: restored.state.checksum.clone(),
                        });
                    }
                    last_completed_checksum = Some(payload.new_state_checksum.clone());
                    replay.push(ReplayStep {
                        step_id: payload.step_id.clone(),
                        delta: payload.state_delta.clone(),
                        new_state_checksum: payload.new_state_checksum.clone(),
                        event_seq: event.event_seq,
                        event_id: event.event_id,
                        attempt_id: payload.attempt_id,
                    });
                }
                EventPayload::StepIntention(_) => restored.intention_count += 1,
                EventPayload::StepFailed(_) => restored.failure_count += 1,
                // Savepoints never change state.
                EventPayload::SavepointCreated(_) => {}
                EventPayload::WorkflowCompleted(_) => {
                    restored.terminal = Some(WorkflowStatus::Completed);
                }
                EventPayload::WorkflowCancelled(_) => {
                    restored.terminal = Some(WorkflowStatus::Cancelled);
                }
            }
        }

        // 4. Final validation: the rebuilt state's checksum must equal the
        // last committed step's recorded checksum.
        if let Some(expected) = last_completed_checksum {
            let actual = codec::state_checksum(&restored.state);
            if actual != expected {
                return Err(EngineError::ChecksumMismatch {
                    scope: format!("final state of '{workflow_id}'"),
                    expected,
                    actual,
                });
            }
        }

        tracing::debug!(
            workflow_id,
            last_event_seq = restored.last_event_seq,
            step_number = restored.state.step_number,
            replayed = replay.len(),
            "restored workflow state"
        );

        Ok(RestorePlan {
            base: base_state,
            replay,
            restored,
        })
    }

    fn check_event(
        &self,
        workflow_id: &str,
        restored: &RestoredState,
        event: &Event,
    ) -> Result<(), EngineError> {
        let expected_seq = restored.last_event_seq + 1;
        if event.event_seq != expected_seq {
            return Err(EngineError::EventSequenceGap {
                workflow_id: workflow_id.to_string(),
                expected: expected_seq,
                found: event.event_seq,
            });
        }
        if restored.terminal.is_some() {
            return Err(EngineError::RecoveryFailed {
                workflow_id: workflow_id.to_string(),
                reason: format!(
                    "event {} follows a terminal event",
                    event.event_seq
                ),
            });
        }
        if !codec::verify_event(event) {
            return Err(EngineError::ChecksumMismatch {
                scope: format!("event {} (seq {})", event.event_id, event.event_seq),
                expected: event.checksum.clone(),
                actual: codec::event_checksum(event),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use duramen_types::event::{
        StepCompletedPayload, StepFailedPayload, StepIntentionPayload, WorkflowCompletedPayload,
    };
    use duramen_types::snapshot::Snapshot;
    use serde_json::json;

    /// Drive a small scripted history through the journal, returning the
    /// state after each committed step.
    async fn scripted_history(store: &MemoryBackend, workflow_id: &str) -> Vec<WorkflowState> {
        let mut state = WorkflowState::empty(workflow_id, "default");
        state.checksum = codec::state_checksum(&state);
        let mut states = vec![state.clone()];

        for (i, (key, value)) in [("x", json!(1)), ("y", json!(2)), ("z", json!(3))]
            .into_iter()
            .enumerate()
        {
            let step_id = format!("s{i}_{i}");
            store
                .append(Event::new(
                    workflow_id,
                    "default",
                    EventPayload::StepIntention(StepIntentionPayload {
                        step_id: step_id.clone(),
                        step_name: format!("s{i}"),
                        attempt_id: 1,
                        fencing_token: 1,
                    }),
                ))
                .await
                .unwrap();

            let mut next = state.clone();
            next.variables.insert(key.to_string(), value);
            next.step_number += 1;
            next.checksum = codec::state_checksum(&next);
            let delta = StateDelta::compute(&state.variables, &next.variables);

            store
                .append(Event::new(
                    workflow_id,
                    "default",
                    EventPayload::StepCompleted(StepCompletedPayload {
                        step_id,
                        attempt_id: 1,
                        state_delta: delta,
                        new_state_checksum: next.checksum.clone(),
                        duration_ms: 5,
                    }),
                ))
                .await
                .unwrap();

            state = next;
            states.push(state.clone());
        }
        states
    }

    #[tokio::test]
    async fn test_restore_replays_to_final_state() {
        let store = MemoryBackend::new();
        let states = scripted_history(&store, "wf-restore").await;

        let recovery = Recovery::new(&store, &store);
        let restored = recovery.restore("wf-restore").await.unwrap();
        assert_eq!(restored.state, states[3]);
        assert_eq!(restored.last_event_seq, 6);
        assert_eq!(restored.intention_count, 3);
        assert_eq!(restored.terminal, None);
    }

    #[tokio::test]
    async fn test_restore_is_deterministic() {
        let store = MemoryBackend::new();
        scripted_history(&store, "wf-det").await;

        let recovery = Recovery::new(&store, &store);
        let first = recovery.restore("wf-det").await.unwrap();
        let second = recovery.restore("wf-det").await.unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(
            codec::state_blob(&first.state),
            codec::state_blob(&second.state)
        );
    }

    #[tokio::test]
    async fn test_restore_from_snapshot_matches_full_replay() {
        let store = MemoryBackend::new();
        let states = scripted_history(&store, "wf-cover").await;

        // Snapshot covering the first two steps (events 1..=4).
        let mut snapshot = Snapshot::capture(states[2].clone(), 4);
        snapshot.state_checksum = codec::state_blob_checksum(&snapshot.state);
        SnapshotStore::put(&store, snapshot).await.unwrap();

        let recovery = Recovery::new(&store, &store);
        let restored = recovery.restore("wf-cover").await.unwrap();
        assert_eq!(restored.state, states[3]);
        // Only the third step lies beyond the snapshot.
        let plan = recovery.plan("wf-cover").await.unwrap();
        assert_eq!(plan.replay.len(), 1);
        assert_eq!(plan.base, states[2]);
    }

    #[tokio::test]
    async fn test_restore_to_point() {
        let store = MemoryBackend::new();
        let states = scripted_history(&store, "wf-point").await;

        let recovery = Recovery::new(&store, &store);
        // Sequence 4 is the second step's completion.
        let restored = recovery.restore_to_point("wf-point", 4).await.unwrap();
        assert_eq!(restored.state, states[2]);
        assert_eq!(restored.state.step_number, 2);
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let store = MemoryBackend::new();
        let recovery = Recovery::new(&store, &store);
        let err = recovery.restore("wf-ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_corrupted_payload_fails_closed() {
        let store = MemoryBackend::new();
        scripted_history(&store, "wf-evil").await;

        // Flip a byte in a step_completed payload (seq 4).
        store.tamper_event("wf-evil", 4, |event| {
            if let EventPayload::StepCompleted(p) = &mut event.payload {
                p.new_state_checksum = format!("0{}", &p.new_state_checksum[1..]);
            }
        });

        let recovery = Recovery::new(&store, &store);
        let err = recovery.restore("wf-evil").await.unwrap_err();
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_sequence_gap_fails_closed() {
        let store = MemoryBackend::new();
        scripted_history(&store, "wf-gap").await;
        store.tamper_event("wf-gap", 3, |event| {
            event.event_seq = 9;
            // Keep the checksum consistent so only the gap trips.
            event.checksum = codec::event_checksum(event);
        });

        let recovery = Recovery::new(&store, &store);
        let err = recovery.restore("wf-gap").await.unwrap_err();
        assert!(matches!(err, EngineError::EventSequenceGap { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_fails_closed() {
        let store = MemoryBackend::new();
        let states = scripted_history(&store, "wf-badsnap").await;

        let mut bad_state = states[2].clone();
        bad_state
            .variables
            .insert("x".to_string(), json!("tampered"));
        // Blob checksum matches the tampered state, but the state's own
        // checksum no longer does.
        let mut snapshot = Snapshot::capture(bad_state, 4);
        snapshot.state_checksum = codec::state_blob_checksum(&snapshot.state);
        SnapshotStore::put(&store, snapshot).await.unwrap();

        let recovery = Recovery::new(&store, &store);
        let err = recovery.restore("wf-badsnap").await.unwrap_err();
        assert!(matches!(err, EngineError::SnapshotCorrupted(_)), "{err}");
    }

    #[tokio::test]
    async fn test_terminal_event_is_reported() {
        let store = MemoryBackend::new();
        let states = scripted_history(&store, "wf-final").await;
        store
            .append(Event::new(
                "wf-final",
                "default",
                EventPayload::WorkflowCompleted(WorkflowCompletedPayload {
                    final_state_checksum: states[3].checksum.clone(),
                }),
            ))
            .await
            .unwrap();

        let recovery = Recovery::new(&store, &store);
        let restored = recovery.restore("wf-final").await.unwrap();
        assert_eq!(restored.terminal, Some(WorkflowStatus::Completed));
    }

    #[tokio::test]
    async fn test_failed_attempts_are_counted_not_applied() {
        let store = MemoryBackend::new();
        let states = scripted_history(&store, "wf-flaky").await;
        store
            .append(Event::new(
                "wf-flaky",
                "default",
                EventPayload::StepFailed(StepFailedPayload {
                    step_id: "s3_3".to_string(),
                    attempt_id: 1,
                    error_kind: "connection".to_string(),
                    error_message: "reset".to_string(),
                }),
            ))
            .await
            .unwrap();

        let recovery = Recovery::new(&store, &store);
        let restored = recovery.restore("wf-flaky").await.unwrap();
        assert_eq!(restored.failure_count, 1);
        assert_eq!(restored.state, states[3]);
    }
}
