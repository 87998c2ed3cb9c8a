//! Workflow runtime: lease lifecycle, background heartbeat, resume
//! dispatch, and teardown.
//!
//! A run acquires the workflow's lease, spawns a heartbeat task renewing
//! it at a third of the TTL, executes the user body (each step funnelled
//! through the step runtime), and on exit appends the terminal event and
//! releases the lease. Heartbeat failure fences the local executor:
//! cancellation propagates to the in-flight step and the body unwinds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use duramen_types::error::StorageError;
use duramen_types::event::{Event, EventPayload, EventType, WorkflowCompletedPayload};
use duramen_types::lease::Lease;
use duramen_types::snapshot::Snapshot;
use duramen_types::state::WorkflowState;
use duramen_types::step::{CompletedStep, RetryPolicy};
use duramen_types::workflow::{WorkflowOutcome, WorkflowStatus};

use crate::codec;
use crate::error::EngineError;
use crate::store::{IdempotencyStore, JournalStore, LeaseStore, SnapshotStore};

use super::Engine;
use super::context::{CancelReason, RunCursor, RunShared, WorkflowContext};
use super::recovery::RestorePlan;

/// How a run enters the runtime.
pub(crate) enum RunStart {
    /// Fresh workflow with a sealed initial state.
    Fresh(WorkflowState),
    /// Resume from a validated restore plan.
    Resume(RestorePlan),
}

impl<J, S, L, I> Engine<J, S, L, I>
where
    J: JournalStore + 'static,
    S: SnapshotStore + 'static,
    L: LeaseStore + 'static,
    I: IdempotencyStore + 'static,
{
    /// Execute a workflow body under the lease/heartbeat/step discipline.
    pub(crate) async fn run_workflow<F, Fut>(
        &self,
        workflow_id: String,
        org_id: String,
        default_retry: RetryPolicy,
        start: RunStart,
        body: F,
    ) -> Result<WorkflowOutcome, EngineError>
    where
        F: FnOnce(WorkflowContext<J, S, L, I>) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        // Admission: exactly one executor per workflow.
        let lease = match self
            .inner
            .leases
            .acquire(
                &workflow_id,
                &org_id,
                &self.inner.executor_id,
                self.inner.config.lease_ttl,
            )
            .await
        {
            Ok(lease) => lease,
            Err(StorageError::Conflict(_)) => {
                return Err(EngineError::WorkflowLocked(workflow_id));
            }
            Err(err) => return Err(err.into()),
        };

        let (state, last_event_seq, replay) = match start {
            RunStart::Fresh(state) => {
                // Persist the genesis snapshot so restore always has a
                // checksummed base covering the start-time metadata and
                // input, which deltas alone cannot reconstruct.
                let mut snapshot = Snapshot::capture(state.clone(), 0);
                snapshot.state_checksum = codec::state_blob_checksum(&snapshot.state);
                self.inner.snapshots.put(snapshot).await?;
                tracing::info!(
                    workflow_id = workflow_id.as_str(),
                    owner_id = lease.owner_id.as_str(),
                    fencing_token = lease.fencing_token,
                    "starting workflow"
                );
                (state, 0, HashMap::new())
            }
            RunStart::Resume(plan) => {
                self.reconcile_completions(&plan, lease.fencing_token).await?;
                let replay: HashMap<String, _> = plan
                    .replay
                    .into_iter()
                    .map(|step| (step.step_id.clone(), step))
                    .collect();
                tracing::info!(
                    workflow_id = workflow_id.as_str(),
                    owner_id = lease.owner_id.as_str(),
                    fencing_token = lease.fencing_token,
                    step_number = plan.restored.state.step_number,
                    replayable = replay.len(),
                    "resuming workflow"
                );
                // Execution starts from the snapshot base; committed steps
                // beyond it replay as the body re-invokes them.
                (plan.base, plan.restored.last_event_seq, replay)
            }
        };

        let run = Arc::new(RunShared {
            workflow_id: workflow_id.clone(),
            org_id: org_id.clone(),
            lease: lease.clone(),
            cancel: CancellationToken::new(),
            cancel_reason: OnceLock::new(),
            default_retry,
            cursor: Mutex::new(RunCursor {
                state,
                step_counter: 0,
                last_event_seq,
                steps_since_snapshot: 0,
                replay,
            }),
        });
        self.inner
            .cancellations
            .insert(workflow_id.clone(), run.cancel.clone());

        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), Arc::clone(&run)));

        let ctx = WorkflowContext {
            engine: self.clone(),
            run: Arc::clone(&run),
        };
        let result = body(ctx).await;

        // Stop the heartbeat before teardown so a completed run's lease is
        // not renewed again.
        run.cancel.cancel();
        let _ = heartbeat.await;
        self.inner.cancellations.remove(&workflow_id);

        let final_state = run.cursor().state.clone();
        let reason = run.cancel_reason();

        match (reason, result) {
            // Fenced out: the lease belongs to another executor; write
            // nothing more, release is a no-op by design.
            (Some(CancelReason::LeaseLost), _) => Err(EngineError::LeaseLost(workflow_id)),
            (_, Err(EngineError::LeaseLost(id))) => Err(EngineError::LeaseLost(id)),

            // Cancelled: the workflow_cancelled event is already in the
            // journal (appended by the cancel command).
            (Some(CancelReason::External), _) | (None, Err(EngineError::StepCancelled(_))) => {
                self.release_lease(&lease).await;
                tracing::info!(workflow_id = workflow_id.as_str(), "workflow cancelled");
                Ok(WorkflowOutcome {
                    workflow_id,
                    status: WorkflowStatus::Cancelled,
                    state: final_state,
                })
            }

            // Normal completion.
            (None, Ok(())) => {
                let event = Event::new(
                    workflow_id.clone(),
                    org_id,
                    EventPayload::WorkflowCompleted(WorkflowCompletedPayload {
                        final_state_checksum: final_state.checksum.clone(),
                    }),
                );
                match self.inner.journal.append(event).await {
                    Ok(_) => {}
                    // A concurrent cancel may have appended the terminal
                    // event first; surface the cancellation instead.
                    Err(StorageError::Conflict(_))
                        if self.last_event_is_cancel(&workflow_id).await =>
                    {
                        self.release_lease(&lease).await;
                        return Ok(WorkflowOutcome {
                            workflow_id,
                            status: WorkflowStatus::Cancelled,
                            state: final_state,
                        });
                    }
                    Err(err) => {
                        self.release_lease(&lease).await;
                        return Err(err.into());
                    }
                }
                self.release_lease(&lease).await;
                tracing::info!(
                    workflow_id = workflow_id.as_str(),
                    step_number = final_state.step_number,
                    "workflow completed"
                );
                Ok(WorkflowOutcome {
                    workflow_id,
                    status: WorkflowStatus::Completed,
                    state: final_state,
                })
            }

            // Unrecoverable failure: the terminal step_failed event is
            // already journaled; release the lease and surface the error.
            (None, Err(err)) => {
                self.release_lease(&lease).await;
                tracing::error!(
                    workflow_id = workflow_id.as_str(),
                    error = %err,
                    "workflow failed"
                );
                Err(err)
            }
        }
    }

    /// Fill idempotency rows missing for committed steps (crash between
    /// journal append and completion insert). The `step_completed` event
    /// is authoritative.
    async fn reconcile_completions(
        &self,
        plan: &RestorePlan,
        fencing_token: u64,
    ) -> Result<(), EngineError> {
        let workflow_id = &plan.restored.state.workflow_id;
        let mut filled = 0u64;
        for step in &plan.replay {
            if self
                .inner
                .idempotency
                .check_completed(workflow_id, &step.step_id)
                .await?
                .is_none()
            {
                let completion = CompletedStep {
                    workflow_id: workflow_id.clone(),
                    step_id: step.step_id.clone(),
                    attempt_id: step.attempt_id,
                    completed_at: Utc::now(),
                    result_ref: step.event_id.to_string(),
                    result_checksum: step.new_state_checksum.clone(),
                    org_id: plan.restored.state.org_id.clone(),
                };
                match self
                    .inner
                    .idempotency
                    .mark_completed(completion, fencing_token)
                    .await
                {
                    Ok(()) | Err(StorageError::Conflict(_)) => filled += 1,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if filled > 0 {
            tracing::warn!(
                workflow_id = workflow_id.as_str(),
                filled,
                "reconciled completion rows from journal"
            );
        }
        Ok(())
    }

    async fn last_event_is_cancel(&self, workflow_id: &str) -> bool {
        if let Ok(Some((max_seq, _))) = self.inner.journal.tail(workflow_id).await {
            if let Ok(events) = self.inner.journal.read_range(workflow_id, max_seq, max_seq).await
            {
                return events
                    .last()
                    .is_some_and(|e| e.event_type() == EventType::WorkflowCancelled);
            }
        }
        false
    }

    async fn release_lease(&self, lease: &Lease) {
        if let Err(err) = self.inner.leases.release(lease).await {
            tracing::warn!(
                workflow_id = lease.workflow_id.as_str(),
                error = %err,
                "lease release failed"
            );
        }
    }
}

/// Renew the lease at a third of the TTL and poll for external
/// cancellation. Any heartbeat rejection fences the local executor: the
/// run's cancellation token fires and in-flight steps unwind rather than
/// retrying indefinitely.
async fn heartbeat_loop<J, S, L, I>(engine: Engine<J, S, L, I>, run: Arc<RunShared>)
where
    J: JournalStore,
    S: SnapshotStore,
    L: LeaseStore,
    I: IdempotencyStore,
{
    let interval = engine.inner.config.heartbeat_interval();
    let ttl = engine.inner.config.lease_ttl;
    let mut last_seen_seq = run.cursor().last_event_seq;

    loop {
        tokio::select! {
            _ = run.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match engine.inner.leases.heartbeat(&run.lease, ttl).await {
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    workflow_id = run.workflow_id.as_str(),
                    owner_id = run.lease.owner_id.as_str(),
                    error = %err,
                    "heartbeat rejected; fencing out local executor"
                );
                run.signal_cancel(CancelReason::LeaseLost);
                return;
            }
        }

        // Poll for a workflow_cancelled event appended by another process.
        if let Ok(Some((max_seq, _))) = engine.inner.journal.tail(&run.workflow_id).await {
            if max_seq > last_seen_seq {
                last_seen_seq = max_seq;
                if let Ok(events) = engine
                    .inner
                    .journal
                    .read_range(&run.workflow_id, max_seq, max_seq)
                    .await
                {
                    if events
                        .last()
                        .is_some_and(|e| e.event_type() == EventType::WorkflowCancelled)
                    {
                        tracing::info!(
                            workflow_id = run.workflow_id.as_str(),
                            "cancellation observed; signalling workflow"
                        );
                        run.signal_cancel(CancelReason::External);
                        return;
                    }
                }
            }
        }
    }
}
