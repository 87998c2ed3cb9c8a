//! Per-run execution context.
//!
//! Carries workflow identity, the held lease (and its fencing token), the
//! in-memory state cursor, and the cancellation token shared with the
//! heartbeat task. No process-wide singletons: everything a step needs is
//! reachable from the context handed to the workflow body.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio_util::sync::CancellationToken;

use duramen_types::lease::Lease;
use duramen_types::state::{Variables, WorkflowState};
use duramen_types::step::RetryPolicy;

use super::Engine;
use super::recovery::ReplayStep;

/// Why the run's cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    /// A `workflow_cancelled` event was observed (or an in-process cancel
    /// command fired).
    External,
    /// The heartbeat was rejected; another executor owns the lease.
    LeaseLost,
}

/// Mutable per-run bookkeeping, guarded by a mutex. Steps execute
/// serially, so contention is limited to short commit sections.
pub(crate) struct RunCursor {
    /// Current workflow state; updated only by committed steps (live or
    /// replayed).
    pub state: WorkflowState,
    /// Step invocations seen in this run (cache hits included). Step ids
    /// are `name_counter`, so a resumed body reproduces the ids of the
    /// original run.
    pub step_counter: u64,
    /// Highest journal sequence this run has observed or written.
    pub last_event_seq: u64,
    /// Completed steps since the last snapshot, for the cadence policy.
    pub steps_since_snapshot: u64,
    /// Committed steps beyond the base snapshot, keyed by step id, waiting
    /// to be replayed onto `state` as the body re-invokes them.
    pub replay: HashMap<String, ReplayStep>,
}

/// State shared between the workflow body, the step runtime, and the
/// heartbeat task.
pub(crate) struct RunShared {
    pub workflow_id: String,
    pub org_id: String,
    pub lease: Lease,
    pub cancel: CancellationToken,
    pub cancel_reason: OnceLock<CancelReason>,
    pub default_retry: RetryPolicy,
    pub cursor: Mutex<RunCursor>,
}

impl RunShared {
    pub(crate) fn cursor(&self) -> MutexGuard<'_, RunCursor> {
        // A poisoned cursor means a panic mid-commit; the run cannot
        // continue coherently.
        self.cursor.lock().expect("run cursor mutex poisoned")
    }

    pub(crate) fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason.get().copied()
    }

    pub(crate) fn signal_cancel(&self, reason: CancelReason) {
        let _ = self.cancel_reason.set(reason);
        self.cancel.cancel();
    }
}

/// Context handed to the user's workflow body. Clone freely; clones refer
/// to the same run.
pub struct WorkflowContext<J, S, L, I> {
    pub(crate) engine: Engine<J, S, L, I>,
    pub(crate) run: Arc<RunShared>,
}

impl<J, S, L, I> Clone for WorkflowContext<J, S, L, I> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            run: Arc::clone(&self.run),
        }
    }
}

impl<J, S, L, I> WorkflowContext<J, S, L, I> {
    pub fn workflow_id(&self) -> &str {
        &self.run.workflow_id
    }

    pub fn org_id(&self) -> &str {
        &self.run.org_id
    }

    /// Fencing token of the lease this run executes under. Steps with
    /// non-idempotent external effects should derive their external
    /// idempotency keys from `(workflow_id, step_id)`, not from this.
    pub fn fencing_token(&self) -> u64 {
        self.run.lease.fencing_token
    }

    /// A copy of the current variables.
    pub fn variables(&self) -> Variables {
        self.run.cursor().state.variables.clone()
    }

    /// A copy of the current workflow state.
    pub fn state(&self) -> WorkflowState {
        self.run.cursor().state.clone()
    }

    /// Whether cancellation (external or via lost lease) has been
    /// signalled to this run.
    pub fn is_cancelled(&self) -> bool {
        self.run.cancel.is_cancelled()
    }
}

impl<J, S, L, I> std::fmt::Debug for WorkflowContext<J, S, L, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &self.run.workflow_id)
            .field("owner_id", &self.run.lease.owner_id)
            .field("fencing_token", &self.run.lease.fencing_token)
            .finish()
    }
}
