//! Persistence trait definitions: the core's dependency boundary.
//!
//! An implementer provides four concrete backends -- journal, snapshot,
//! lease, and idempotency stores -- plus a blob store for oversized
//! snapshot states. The in-memory reference backend lives in
//! [`memory`]; the SQLite backend lives in `duramen-infra`.
//!
//! Uses native async fn in traits via return-position `impl Trait`
//! (Rust 2024 edition, no async_trait macro).

pub mod memory;

use std::time::Duration;

use uuid::Uuid;

use duramen_types::error::StorageError;
use duramen_types::event::Event;
use duramen_types::lease::Lease;
use duramen_types::snapshot::Snapshot;
use duramen_types::step::{CompletedStep, StepAttempt};

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

/// Append-only, per-workflow ordered event log.
///
/// Implementations must enforce uniqueness on `(workflow_id, event_seq)`
/// and on `event_id`, and must order reads by `event_seq`, never by
/// timestamp.
pub trait JournalStore: Send + Sync {
    /// Atomically assign the next `event_seq` for the event's workflow,
    /// recompute the checksum, and insert. Returns the stored event. A
    /// sequence conflict restarts or fails cleanly -- never skips.
    fn append(
        &self,
        event: Event,
    ) -> impl Future<Output = Result<Event, StorageError>> + Send;

    /// Events with `from_seq <= event_seq <= to_seq`, strictly ascending.
    fn read_range(
        &self,
        workflow_id: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> impl Future<Output = Result<Vec<Event>, StorageError>> + Send;

    /// Highest persisted `(event_seq, event_id)` for the workflow, if any.
    fn tail(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Option<(u64, Uuid)>, StorageError>> + Send;
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Step-keyed state snapshots, indexed by the last covered event sequence.
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot. Idempotent with respect to `snapshot_id`.
    /// Backends may spill the state to external blob storage; an orphan
    /// metadata row without its blob must never be created.
    fn put(&self, snapshot: Snapshot) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Snapshot by id, state resolved and checksum-verified.
    fn get(
        &self,
        snapshot_id: &Uuid,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send;

    /// The snapshot with the greatest `last_event_seq <= max_seq`, if any.
    fn get_latest(
        &self,
        workflow_id: &str,
        max_seq: u64,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send;

    /// All snapshots for the workflow, descending by `last_event_seq`.
    fn list(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Vec<Snapshot>, StorageError>> + Send;
}

/// Opaque external blob storage used by snapshot backends for oversized
/// states.
pub trait BlobStore: Send + Sync {
    fn put(
        &self,
        key: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = Result<Vec<u8>, StorageError>> + Send;
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// Single-owner admission with fencing tokens.
pub trait LeaseStore: Send + Sync {
    /// Atomically insert a fresh lease (no prior row, or the prior lease
    /// expired), issuing `fencing_token = previous + 1` (or 1). Fails with
    /// [`StorageError::Conflict`] while a live lease exists.
    fn acquire(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<Lease, StorageError>> + Send;

    /// Extend the lease by `ttl` iff `(workflow_id, owner_id,
    /// fencing_token)` still match the stored row. A mismatch means the
    /// owner has been fenced out and returns [`StorageError::Fenced`].
    fn heartbeat(
        &self,
        lease: &Lease,
        ttl: Duration,
    ) -> impl Future<Output = Result<Lease, StorageError>> + Send;

    /// Delete the row under the same three-way match; a mismatch is a
    /// no-op (the lease was already reclaimed).
    fn release(&self, lease: &Lease) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// The current lease row, live or expired, if one exists.
    fn get(
        &self,
        workflow_id: &str,
    ) -> impl Future<Output = Result<Option<Lease>, StorageError>> + Send;
}

// ---------------------------------------------------------------------------
// Idempotency
// ---------------------------------------------------------------------------

/// Result of an attempt allocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// A fresh attempt was allocated.
    Attempt(StepAttempt),
    /// The step is already completed; no attempt was allocated.
    AlreadyCompleted(CompletedStep),
}

/// Per-(workflow, step) attempt allocation and completion records,
/// enforcing exactly-once commit.
pub trait IdempotencyStore: Send + Sync {
    /// The completion record for the step, if any.
    fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> impl Future<Output = Result<Option<CompletedStep>, StorageError>> + Send;

    /// Insert an attempt with `attempt_id = 1 + max(existing)`. Returns
    /// the completion instead when the step is already committed. A
    /// `fencing_token` that does not match the current lease returns
    /// [`StorageError::Fenced`].
    fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        fencing_token: u64,
    ) -> impl Future<Output = Result<AttemptOutcome, StorageError>> + Send;

    /// Insert the unique completion row. Rejects with
    /// [`StorageError::Conflict`] when another attempt already committed,
    /// and with [`StorageError::Fenced`] on a stale token.
    fn mark_completed(
        &self,
        completion: CompletedStep,
        fencing_token: u64,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}
