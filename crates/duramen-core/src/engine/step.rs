//! The step runtime: write-ahead intention, at-most-once execution under a
//! valid lease, exactly-once commit.
//!
//! Protocol per logical step invocation:
//!
//! 1. Derive the deterministic `step_id` from the step name and the
//!    per-run invocation counter.
//! 2. Cache lookup: an existing completion is adopted without running the
//!    user function.
//! 3. Allocate an attempt (fencing-token mismatch is a fatal lease loss).
//! 4. Append `step_intention`.
//! 5. Execute the user function under the step timeout, racing the run's
//!    cancellation token.
//! 6. On failure append `step_failed` and consult the retry policy
//!    (exponential backoff with jitter, capped).
//! 7. On success append `step_completed` (state delta + new checksum) and
//!    mark the idempotency completion.
//! 8. Apply the snapshot policy (cadence, savepoint).
//!
//! Between (4) and (7) no externally visible state is claimed: a crash
//! leaves an intention without a completion and the step re-executes on
//! resume. User functions must be idempotent or carry external idempotency
//! keys derived from `(workflow_id, step_id)`.

use std::time::{Duration, Instant};

use chrono::Utc;
use uuid::Uuid;

use duramen_types::error::StorageError;
use duramen_types::event::{
    Event, EventPayload, SavepointCreatedPayload, StepCompletedPayload, StepFailedPayload,
    StepIntentionPayload,
};
use duramen_types::delta::StateDelta;
use duramen_types::savepoint::SavepointMetadata;
use duramen_types::snapshot::Snapshot;
use duramen_types::state::{Variables, WorkflowState};
use duramen_types::step::{CompletedStep, RetryPolicy, StepFailure, StepOptions, TIMEOUT_ERROR_KIND};

use crate::codec;
use crate::error::EngineError;
use crate::store::{AttemptOutcome, IdempotencyStore, JournalStore, LeaseStore, SnapshotStore};

use super::context::{CancelReason, WorkflowContext};

/// Outcome of one execution attempt of the user function.
enum Exec {
    Done(Result<Variables, StepFailure>),
    Cancelled,
    TimedOut,
}

impl<J, S, L, I> WorkflowContext<J, S, L, I>
where
    J: JournalStore,
    S: SnapshotStore,
    L: LeaseStore,
    I: IdempotencyStore,
{
    /// Run a step with default options. See [`Self::step_with`].
    pub async fn step<F, Fut>(&self, name: &str, f: F) -> Result<Variables, EngineError>
    where
        F: Fn(Variables) -> Fut,
        Fut: Future<Output = Result<Variables, StepFailure>>,
    {
        self.step_with(name, StepOptions::default(), f).await
    }

    /// Run a user function as a durable step.
    ///
    /// `f` receives a copy of the current variables and returns the
    /// entries to merge into them. The call returns the full post-step
    /// variables. On replay of an already-committed step the function is
    /// not invoked and the recorded result is adopted.
    pub async fn step_with<F, Fut>(
        &self,
        name: &str,
        opts: StepOptions,
        f: F,
    ) -> Result<Variables, EngineError>
    where
        F: Fn(Variables) -> Fut,
        Fut: Future<Output = Result<Variables, StepFailure>>,
    {
        let step_id = {
            let cursor = self.run.cursor();
            format!("{}_{}", name, cursor.step_counter)
        };
        let workflow_id = self.run.workflow_id.clone();
        let fencing_token = self.run.lease.fencing_token;

        // 2. Cache lookup: committed steps are never re-executed.
        if let Some(completion) = self
            .engine
            .inner
            .idempotency
            .check_completed(&workflow_id, &step_id)
            .await?
        {
            return self.adopt_completion(&step_id, &completion);
        }

        let retry = opts
            .retry
            .clone()
            .unwrap_or_else(|| self.run.default_retry.clone());

        loop {
            self.check_cancelled(&step_id)?;

            // 3. Attempt allocation, fenced by the current lease token.
            let attempt_id = match self
                .engine
                .inner
                .idempotency
                .allocate_attempt(&workflow_id, &step_id, fencing_token)
                .await
            {
                Ok(AttemptOutcome::Attempt(attempt)) => attempt.attempt_id,
                Ok(AttemptOutcome::AlreadyCompleted(completion)) => {
                    // Committed between lookup and allocation -- only
                    // possible if another executor raced us in.
                    return self.adopt_completion(&step_id, &completion);
                }
                Err(StorageError::Fenced(_)) => {
                    return Err(EngineError::LeaseLost(workflow_id));
                }
                Err(err) => return Err(err.into()),
            };

            // 4. Write-ahead intention.
            let intention = self
                .append(EventPayload::StepIntention(StepIntentionPayload {
                    step_id: step_id.clone(),
                    step_name: name.to_string(),
                    attempt_id,
                    fencing_token,
                }))
                .await?;
            tracing::debug!(
                workflow_id = workflow_id.as_str(),
                step_id = step_id.as_str(),
                attempt_id,
                seq = intention.event_seq,
                "step intention recorded"
            );

            // 5. Execute under timeout and cancellation.
            let input = self.run.cursor().state.variables.clone();
            let started = Instant::now();
            let outcome = self.execute_attempt(&opts, f(input)).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let failure = match outcome {
                Exec::Done(Ok(result)) => {
                    return self
                        .commit_step(&opts, &step_id, attempt_id, result, duration_ms)
                        .await;
                }
                Exec::Done(Err(failure)) => failure,
                Exec::Cancelled => return Err(self.cancel_error(&step_id)),
                Exec::TimedOut => StepFailure::new(
                    TIMEOUT_ERROR_KIND,
                    format!(
                        "attempt exceeded {} ms",
                        opts.timeout.unwrap_or(Duration::ZERO).as_millis()
                    ),
                ),
            };

            // 6. Record the failed attempt and consult the retry policy.
            self.append(EventPayload::StepFailed(StepFailedPayload {
                step_id: step_id.clone(),
                attempt_id,
                error_kind: failure.kind.clone(),
                error_message: failure.message.clone(),
            }))
            .await?;

            if retry.should_retry(attempt_id, &failure.kind) {
                let delay = retry.backoff_delay(attempt_id, rand::random::<f64>());
                tracing::warn!(
                    workflow_id = workflow_id.as_str(),
                    step_id = step_id.as_str(),
                    attempt_id,
                    error_kind = failure.kind.as_str(),
                    backoff_ms = delay.as_millis() as u64,
                    "step attempt failed; retrying"
                );
                tokio::select! {
                    _ = self.run.cancel.cancelled() => return Err(self.cancel_error(&step_id)),
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            tracing::error!(
                workflow_id = workflow_id.as_str(),
                step_id = step_id.as_str(),
                attempt_id,
                error_kind = failure.kind.as_str(),
                "step failed with no retry budget left"
            );
            return Err(Self::terminal_step_error(
                &step_id, attempt_id, &opts, &retry, failure,
            ));
        }
    }

    /// Create a savepoint (with its backing snapshot) at the current step
    /// boundary, outside any step. Equivalent to completing a step with
    /// `savepoint: true`.
    pub async fn savepoint(&self, metadata: SavepointMetadata) -> Result<Uuid, EngineError> {
        let state = self.run.cursor().state.clone();
        let snapshot_id = self.write_snapshot(&state).await?;
        self.append_savepoint(&state, snapshot_id, metadata).await
    }

    // -----------------------------------------------------------------------
    // Commit path
    // -----------------------------------------------------------------------

    async fn commit_step(
        &self,
        opts: &StepOptions,
        step_id: &str,
        attempt_id: u32,
        result: Variables,
        duration_ms: u64,
    ) -> Result<Variables, EngineError> {
        let workflow_id = self.run.workflow_id.clone();
        let fencing_token = self.run.lease.fencing_token;

        // Re-validate the lease immediately before claiming the commit; a
        // stalled executor whose lease was taken over must not write a
        // completion.
        match self
            .engine
            .inner
            .leases
            .heartbeat(&self.run.lease, self.engine.inner.config.lease_ttl)
            .await
        {
            Ok(_) => {}
            Err(StorageError::Fenced(_)) | Err(StorageError::NotFound) => {
                return Err(EngineError::LeaseLost(workflow_id));
            }
            Err(err) => return Err(err.into()),
        }
        self.check_cancelled(step_id)?;

        let (new_state, delta) = {
            let cursor = self.run.cursor();
            let mut next = cursor.state.clone();
            for (key, value) in result {
                next.variables.insert(key, value);
            }
            next.step_number += 1;
            next.checksum = codec::state_checksum(&next);
            let delta = StateDelta::compute(&cursor.state.variables, &next.variables);
            (next, delta)
        };

        // 7a. Journal commit.
        let completed = self
            .append(EventPayload::StepCompleted(StepCompletedPayload {
                step_id: step_id.to_string(),
                attempt_id,
                state_delta: delta,
                new_state_checksum: new_state.checksum.clone(),
                duration_ms,
            }))
            .await?;

        // 7b. Idempotency commit. A missing row after a crash between 7a
        // and 7b is reconciled from the journal on the next resume.
        let completion = CompletedStep {
            workflow_id: workflow_id.clone(),
            step_id: step_id.to_string(),
            attempt_id,
            completed_at: Utc::now(),
            result_ref: completed.event_id.to_string(),
            result_checksum: new_state.checksum.clone(),
            org_id: self.run.org_id.clone(),
        };
        match self
            .engine
            .inner
            .idempotency
            .mark_completed(completion, fencing_token)
            .await
        {
            Ok(()) => {}
            // Either a takeover raced the commit in (Conflict) or the
            // token went stale (Fenced); both mean this executor must
            // stop claiming work.
            Err(StorageError::Fenced(_)) | Err(StorageError::Conflict(_)) => {
                return Err(EngineError::LeaseLost(workflow_id));
            }
            Err(err) => return Err(err.into()),
        }

        let snapshot_due = {
            let mut cursor = self.run.cursor();
            cursor.state = new_state.clone();
            cursor.step_counter += 1;
            cursor.last_event_seq = completed.event_seq;
            cursor.steps_since_snapshot += 1;
            opts.savepoint
                || (opts.checkpoint
                    && cursor.steps_since_snapshot >= self.engine.inner.config.snapshot_interval)
        };

        tracing::info!(
            workflow_id = workflow_id.as_str(),
            step_id,
            attempt_id,
            duration_ms,
            step_number = new_state.step_number,
            "step committed"
        );

        // 8. Snapshot policy: cadence (gated by the step's checkpoint
        // hint) or an explicit savepoint.
        if snapshot_due {
            let snapshot_id = self.write_snapshot(&new_state).await?;
            if opts.savepoint {
                let metadata = SavepointMetadata::from_variables(&new_state.variables);
                self.append_savepoint(&new_state, snapshot_id, metadata)
                    .await?;
            }
        }

        Ok(new_state.variables)
    }

    // -----------------------------------------------------------------------
    // Replay path
    // -----------------------------------------------------------------------

    /// Adopt a recorded completion: apply its delta when the step lies
    /// beyond the base snapshot, verify checksums, and return the state
    /// variables without invoking the user function.
    fn adopt_completion(
        &self,
        step_id: &str,
        completion: &CompletedStep,
    ) -> Result<Variables, EngineError> {
        let mut cursor = self.run.cursor();
        if let Some(replay) = cursor.replay.remove(step_id) {
            replay.delta.apply(&mut cursor.state.variables);
            cursor.state.step_number += 1;
            cursor.state.checksum = codec::state_checksum(&cursor.state);
            if cursor.state.checksum != replay.new_state_checksum {
                return Err(EngineError::ChecksumMismatch {
                    scope: format!("replayed step '{step_id}'"),
                    expected: replay.new_state_checksum.clone(),
                    actual: cursor.state.checksum.clone(),
                });
            }
            if completion.result_checksum != replay.new_state_checksum {
                return Err(EngineError::ChecksumMismatch {
                    scope: format!("completion record for '{step_id}'"),
                    expected: replay.new_state_checksum.clone(),
                    actual: completion.result_checksum.clone(),
                });
            }
            cursor.last_event_seq = cursor.last_event_seq.max(replay.event_seq);
        }
        // Steps covered by the base snapshot carry no replay entry; the
        // snapshot state already reflects them.
        cursor.step_counter += 1;
        tracing::debug!(
            workflow_id = self.run.workflow_id.as_str(),
            step_id,
            "step already completed; adopting recorded result"
        );
        Ok(cursor.state.variables.clone())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn execute_attempt<Fut>(&self, opts: &StepOptions, fut: Fut) -> Exec
    where
        Fut: Future<Output = Result<Variables, StepFailure>>,
    {
        match opts.timeout {
            Some(limit) => tokio::select! {
                _ = self.run.cancel.cancelled() => Exec::Cancelled,
                outcome = tokio::time::timeout(limit, fut) => match outcome {
                    Ok(user) => Exec::Done(user),
                    Err(_) => Exec::TimedOut,
                },
            },
            None => tokio::select! {
                _ = self.run.cancel.cancelled() => Exec::Cancelled,
                user = fut => Exec::Done(user),
            },
        }
    }

    async fn append(&self, payload: EventPayload) -> Result<Event, EngineError> {
        let event = Event::new(
            self.run.workflow_id.clone(),
            self.run.org_id.clone(),
            payload,
        );
        let stored = self.engine.inner.journal.append(event).await?;
        let mut cursor = self.run.cursor();
        cursor.last_event_seq = cursor.last_event_seq.max(stored.event_seq);
        Ok(stored)
    }

    async fn write_snapshot(&self, state: &WorkflowState) -> Result<Uuid, EngineError> {
        let last_event_seq = self.run.cursor().last_event_seq;
        let mut snapshot = Snapshot::capture(state.clone(), last_event_seq);
        snapshot.state_checksum = codec::state_blob_checksum(&snapshot.state);
        let snapshot_id = snapshot.snapshot_id;
        self.engine.inner.snapshots.put(snapshot).await?;
        self.run.cursor().steps_since_snapshot = 0;
        tracing::debug!(
            workflow_id = self.run.workflow_id.as_str(),
            snapshot_id = %snapshot_id,
            last_event_seq,
            step_number = state.step_number,
            "snapshot written"
        );
        Ok(snapshot_id)
    }

    async fn append_savepoint(
        &self,
        state: &WorkflowState,
        snapshot_id: Uuid,
        metadata: SavepointMetadata,
    ) -> Result<Uuid, EngineError> {
        let savepoint_id = Uuid::now_v7();
        self.append(EventPayload::SavepointCreated(SavepointCreatedPayload {
            savepoint_id,
            step_number: state.step_number,
            goal_summary: metadata.goal_summary,
            hypotheses: metadata.hypotheses,
            questions: metadata.questions,
            decisions: metadata.decisions,
            next_step: metadata.next_step,
            snapshot_ref: snapshot_id.to_string(),
        }))
        .await?;
        tracing::info!(
            workflow_id = self.run.workflow_id.as_str(),
            savepoint_id = %savepoint_id,
            step_number = state.step_number,
            "savepoint created"
        );
        Ok(savepoint_id)
    }

    fn cancel_error(&self, step_id: &str) -> EngineError {
        match self.run.cancel_reason() {
            Some(CancelReason::LeaseLost) => {
                EngineError::LeaseLost(self.run.workflow_id.clone())
            }
            _ => EngineError::StepCancelled(step_id.to_string()),
        }
    }

    fn check_cancelled(&self, step_id: &str) -> Result<(), EngineError> {
        if self.run.cancel.is_cancelled() {
            Err(self.cancel_error(step_id))
        } else {
            Ok(())
        }
    }

    fn terminal_step_error(
        step_id: &str,
        attempt_id: u32,
        opts: &StepOptions,
        retry: &RetryPolicy,
        failure: StepFailure,
    ) -> EngineError {
        if failure.kind == TIMEOUT_ERROR_KIND {
            EngineError::StepTimeout {
                step_id: step_id.to_string(),
                timeout_ms: opts.timeout.unwrap_or(Duration::ZERO).as_millis() as u64,
            }
        } else if retry.is_retryable(&failure.kind) {
            EngineError::TooManyAttempts {
                step_id: step_id.to_string(),
                attempts: attempt_id,
            }
        } else {
            EngineError::StepExecutionFailed {
                step_id: step_id.to_string(),
                kind: failure.kind,
                message: failure.message,
            }
        }
    }
}
