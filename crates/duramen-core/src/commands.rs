//! Public command surface: Start, Resume, Status, ListSavepoints,
//! TimeTravel, Cancel.
//!
//! This is the local contract transports sit on top of; it performs no
//! authentication and treats `org_id` as opaque. Step timeouts and
//! cancellation are cooperative: user code that ignores the cancellation
//! signal still has its timeout/cancellation recorded at the timer
//! boundary, and the lease lapses rather than the code being stopped
//! forcibly.

use chrono::Utc;
use uuid::Uuid;

use duramen_types::event::{Event, EventPayload, EventType, WorkflowCancelledPayload};
use duramen_types::savepoint::Savepoint;
use duramen_types::snapshot::Snapshot;
use duramen_types::state::{DEFAULT_ORG_ID, WorkflowState};
use duramen_types::step::RetryPolicy;
use duramen_types::workflow::{StartOptions, StatusReport, WorkflowOutcome, WorkflowStatus};

use crate::codec;
use crate::engine::Engine;
use crate::engine::context::WorkflowContext;
use crate::engine::runtime::RunStart;
use crate::error::EngineError;
use crate::store::{IdempotencyStore, JournalStore, LeaseStore, SnapshotStore};

/// Metadata key under which the start-time default retry policy is
/// persisted, so resumes apply the same policy.
const RETRY_POLICY_METADATA_KEY: &str = "retry_policy";

impl<J, S, L, I> Engine<J, S, L, I>
where
    J: JournalStore + 'static,
    S: SnapshotStore + 'static,
    L: LeaseStore + 'static,
    I: IdempotencyStore + 'static,
{
    /// Start a new workflow and execute its body to completion (or until
    /// it suspends by failing). Returns the outcome with the generated
    /// workflow id.
    pub async fn start<F, Fut>(
        &self,
        opts: StartOptions,
        body: F,
    ) -> Result<WorkflowOutcome, EngineError>
    where
        F: FnOnce(WorkflowContext<J, S, L, I>) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        self.inner.config.validate(opts.retry_policy.as_ref())?;
        if opts.workflow_name.trim().is_empty() {
            return Err(EngineError::Config(
                "workflow_name must not be empty".to_string(),
            ));
        }

        let workflow_id = opts
            .workflow_id
            .clone()
            .unwrap_or_else(|| format!("wf-{}", Uuid::now_v7()));
        let org_id = opts
            .org_id
            .clone()
            .unwrap_or_else(|| DEFAULT_ORG_ID.to_string());

        // An explicit id must not collide with existing history.
        if self.inner.journal.tail(&workflow_id).await?.is_some()
            || self
                .inner
                .snapshots
                .get_latest(&workflow_id, u64::MAX)
                .await?
                .is_some()
        {
            return Err(EngineError::WorkflowAlreadyExists(workflow_id));
        }

        let mut state = WorkflowState::initial(
            &workflow_id,
            &opts.workflow_name,
            &org_id,
            Utc::now(),
            &opts.tags,
        );
        state.variables = opts.input.clone();
        if let Some(policy) = &opts.retry_policy {
            if let Ok(value) = serde_json::to_value(policy) {
                state
                    .metadata
                    .insert(RETRY_POLICY_METADATA_KEY.to_string(), value);
            }
        }
        state.checksum = codec::state_checksum(&state);

        let default_retry = opts
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.inner.config.default_retry.clone());

        self.run_workflow(
            workflow_id,
            org_id,
            default_retry,
            RunStart::Fresh(state),
            body,
        )
        .await
    }

    /// Re-enter a suspended workflow: restore its state, reconcile the
    /// idempotency table, and run the body again. Already-committed steps
    /// replay from their recorded results without invoking user code.
    pub async fn resume<F, Fut>(
        &self,
        workflow_id: &str,
        body: F,
    ) -> Result<WorkflowOutcome, EngineError>
    where
        F: FnOnce(WorkflowContext<J, S, L, I>) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        self.inner.config.validate(None)?;
        let plan = self.recovery().plan(workflow_id).await?;
        if plan.restored.terminal.is_some() {
            return Err(EngineError::WorkflowAlreadyCompleted(
                workflow_id.to_string(),
            ));
        }

        let org_id = plan.restored.state.org_id.clone();
        let default_retry = plan
            .restored
            .state
            .metadata
            .get(RETRY_POLICY_METADATA_KEY)
            .cloned()
            .and_then(|v| serde_json::from_value::<RetryPolicy>(v).ok())
            .unwrap_or_else(|| self.inner.config.default_retry.clone());

        self.run_workflow(
            workflow_id.to_string(),
            org_id,
            default_retry,
            RunStart::Resume(plan),
            body,
        )
        .await
    }

    /// Derived status plus execution counters for a workflow.
    pub async fn status(&self, workflow_id: &str) -> Result<StatusReport, EngineError> {
        let restored = self.recovery().restore(workflow_id).await?;
        let tail = self.inner.journal.tail(workflow_id).await?;
        let event_count = tail.map(|(seq, _)| seq).unwrap_or(0);
        let lease = self.inner.leases.get(workflow_id).await?;
        let snapshot_count = self.inner.snapshots.list(workflow_id).await?.len() as u64;
        let savepoints = self.list_savepoints(workflow_id).await?;

        let status = if let Some(terminal) = restored.terminal {
            terminal
        } else if event_count == 0 {
            WorkflowStatus::Pending
        } else if lease.as_ref().is_some_and(|l| l.is_live(Utc::now())) {
            WorkflowStatus::Running
        } else if self.last_event_type(workflow_id).await? == Some(EventType::StepFailed) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Suspended
        };

        Ok(StatusReport {
            workflow_id: workflow_id.to_string(),
            status,
            step_number: restored.state.step_number,
            lease,
            event_count,
            snapshot_count,
            savepoints,
        })
    }

    /// All savepoints recorded for a workflow, oldest first.
    pub async fn list_savepoints(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<Savepoint>, EngineError> {
        let events = self
            .inner
            .journal
            .read_range(workflow_id, 1, u64::MAX)
            .await?;
        if events.is_empty()
            && self
                .inner
                .snapshots
                .get_latest(workflow_id, u64::MAX)
                .await?
                .is_none()
        {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
        }

        Ok(events
            .iter()
            .filter_map(|event| match &event.payload {
                EventPayload::SavepointCreated(payload) => Some(Savepoint::from_payload(
                    workflow_id,
                    payload,
                    event.timestamp,
                )),
                _ => None,
            })
            .collect())
    }

    /// Branch a new workflow from a savepoint. The new workflow's initial
    /// state is the state captured at the savepoint's snapshot; its
    /// journal and idempotency table start empty, and the original
    /// workflow is untouched. Returns the new workflow id; drive it with
    /// [`Self::resume`].
    pub async fn time_travel(
        &self,
        workflow_id: &str,
        savepoint_id: Uuid,
    ) -> Result<String, EngineError> {
        let savepoints = self.list_savepoints(workflow_id).await?;
        let savepoint = savepoints
            .into_iter()
            .find(|sp| sp.savepoint_id == savepoint_id)
            .ok_or_else(|| EngineError::InvalidSavepoint(savepoint_id.to_string()))?;

        let snapshot_id: Uuid = savepoint
            .snapshot_ref
            .parse()
            .map_err(|_| EngineError::InvalidSavepoint(savepoint_id.to_string()))?;
        let snapshot = self
            .inner
            .snapshots
            .get(&snapshot_id)
            .await?
            .ok_or_else(|| EngineError::InvalidSavepoint(savepoint_id.to_string()))?;
        if !codec::verify_state(&snapshot.state) {
            return Err(EngineError::SnapshotCorrupted(snapshot_id.to_string()));
        }

        let new_workflow_id = format!("wf-{}", Uuid::now_v7());
        let mut state = snapshot.state;
        state.workflow_id = new_workflow_id.clone();
        state
            .metadata
            .insert("branched_from".to_string(), workflow_id.into());
        state.metadata.insert(
            "branched_from_savepoint".to_string(),
            savepoint_id.to_string().into(),
        );
        state.checksum = codec::state_checksum(&state);

        let mut branch = Snapshot::capture(state, 0);
        branch.state_checksum = codec::state_blob_checksum(&branch.state);
        self.inner.snapshots.put(branch).await?;

        tracing::info!(
            workflow_id,
            savepoint_id = %savepoint_id,
            new_workflow_id = new_workflow_id.as_str(),
            "branched workflow from savepoint"
        );
        Ok(new_workflow_id)
    }

    /// Append `workflow_cancelled`. An in-process executor is signalled
    /// immediately; remote executors detect the event on their next
    /// heartbeat cycle and abort cooperatively.
    pub async fn cancel(&self, workflow_id: &str, reason: &str) -> Result<(), EngineError> {
        let last = self.last_event_type(workflow_id).await?;
        if last.is_some_and(|ty| ty.is_terminal()) {
            return Err(EngineError::WorkflowAlreadyCompleted(
                workflow_id.to_string(),
            ));
        }

        // A freshly started workflow may not have journaled anything yet;
        // its genesis snapshot still proves it exists.
        let org_id = match self
            .inner
            .journal
            .read_range(workflow_id, 1, 1)
            .await?
            .first()
        {
            Some(event) => event.org_id.clone(),
            None => self
                .inner
                .snapshots
                .get_latest(workflow_id, u64::MAX)
                .await?
                .map(|s| s.org_id)
                .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?,
        };

        self.inner
            .journal
            .append(Event::new(
                workflow_id,
                org_id,
                EventPayload::WorkflowCancelled(WorkflowCancelledPayload {
                    reason: reason.to_string(),
                }),
            ))
            .await?;

        if let Some(token) = self.inner.cancellations.get(workflow_id) {
            token.cancel();
        }
        tracing::info!(workflow_id, reason, "workflow cancellation recorded");
        Ok(())
    }

    async fn last_event_type(
        &self,
        workflow_id: &str,
    ) -> Result<Option<EventType>, EngineError> {
        let Some((max_seq, _)) = self.inner.journal.tail(workflow_id).await? else {
            return Ok(None);
        };
        Ok(self
            .inner
            .journal
            .read_range(workflow_id, max_seq, max_seq)
            .await?
            .last()
            .map(|e| e.event_type()))
    }
}
