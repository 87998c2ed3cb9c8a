//! In-memory reference backend.
//!
//! A single [`MemoryBackend`] implements every store trait over one set of
//! tables behind a mutex, mirroring the relational layout the SQLite
//! backend uses. Suitable for tests and for embedding the engine without a
//! database; state does not survive the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use duramen_types::error::StorageError;
use duramen_types::event::Event;
use duramen_types::lease::Lease;
use duramen_types::snapshot::Snapshot;
use duramen_types::step::{CompletedStep, StepAttempt};

use crate::codec;

use super::{AttemptOutcome, BlobStore, IdempotencyStore, JournalStore, LeaseStore, SnapshotStore};

#[derive(Default)]
struct Tables {
    /// Per-workflow event log; index `i` holds `event_seq = i + 1`.
    events: HashMap<String, Vec<Event>>,
    event_ids: HashMap<Uuid, String>,
    snapshots: HashMap<Uuid, Snapshot>,
    leases: HashMap<String, Lease>,
    attempts: HashMap<(String, String), Vec<StepAttempt>>,
    completions: HashMap<(String, String), CompletedStep>,
    blobs: HashMap<String, Vec<u8>>,
}

/// Shared-handle in-memory backend. Cloning shares the underlying tables.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A poisoned mutex means a panic mid-write; the tables may be
        // inconsistent, so propagate the panic rather than limp on.
        self.inner.lock().expect("memory backend mutex poisoned")
    }
}

#[cfg(test)]
impl MemoryBackend {
    /// Mutate a stored event in place, bypassing append-time checksum
    /// assignment. Lets integrity tests corrupt history the way a faulty
    /// disk or driver would.
    pub(crate) fn tamper_event(
        &self,
        workflow_id: &str,
        event_seq: u64,
        f: impl FnOnce(&mut Event),
    ) {
        let mut tables = self.lock();
        if let Some(event) = tables
            .events
            .get_mut(workflow_id)
            .and_then(|log| log.iter_mut().find(|e| e.event_seq == event_seq))
        {
            f(event);
        }
    }
}

// ---------------------------------------------------------------------------
// JournalStore
// ---------------------------------------------------------------------------

impl JournalStore for MemoryBackend {
    async fn append(&self, mut event: Event) -> Result<Event, StorageError> {
        let mut tables = self.lock();

        if tables.event_ids.contains_key(&event.event_id) {
            return Err(StorageError::Conflict(format!(
                "event id {} already exists",
                event.event_id
            )));
        }

        let log = tables.events.entry(event.workflow_id.clone()).or_default();
        if let Some(last) = log.last() {
            if last.event_type().is_terminal() {
                return Err(StorageError::Conflict(format!(
                    "workflow '{}' already has terminal event {}",
                    event.workflow_id,
                    last.event_type()
                )));
            }
        }

        event.event_seq = log.len() as u64 + 1;
        event.checksum = codec::event_checksum(&event);
        log.push(event.clone());
        tables
            .event_ids
            .insert(event.event_id, event.workflow_id.clone());
        Ok(event)
    }

    async fn read_range(
        &self,
        workflow_id: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<Event>, StorageError> {
        let tables = self.lock();
        let Some(log) = tables.events.get(workflow_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .filter(|e| e.event_seq >= from_seq && e.event_seq <= to_seq)
            .cloned()
            .collect())
    }

    async fn tail(&self, workflow_id: &str) -> Result<Option<(u64, Uuid)>, StorageError> {
        let tables = self.lock();
        Ok(tables
            .events
            .get(workflow_id)
            .and_then(|log| log.last())
            .map(|e| (e.event_seq, e.event_id)))
    }
}

// ---------------------------------------------------------------------------
// SnapshotStore
// ---------------------------------------------------------------------------

impl SnapshotStore for MemoryBackend {
    async fn put(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let mut tables = self.lock();
        // Idempotent with respect to snapshot_id.
        tables
            .snapshots
            .entry(snapshot.snapshot_id)
            .or_insert(snapshot);
        Ok(())
    }

    async fn get(&self, snapshot_id: &Uuid) -> Result<Option<Snapshot>, StorageError> {
        let tables = self.lock();
        tables
            .snapshots
            .get(snapshot_id)
            .map(|s| verify_snapshot(s).map(|_| s.clone()))
            .transpose()
    }

    async fn get_latest(
        &self,
        workflow_id: &str,
        max_seq: u64,
    ) -> Result<Option<Snapshot>, StorageError> {
        let tables = self.lock();
        tables
            .snapshots
            .values()
            .filter(|s| s.workflow_id == workflow_id && s.last_event_seq <= max_seq)
            .max_by_key(|s| s.last_event_seq)
            .map(|s| verify_snapshot(s).map(|_| s.clone()))
            .transpose()
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<Snapshot>, StorageError> {
        let tables = self.lock();
        let mut snapshots: Vec<Snapshot> = tables
            .snapshots
            .values()
            .filter(|s| s.workflow_id == workflow_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.last_event_seq.cmp(&a.last_event_seq));
        Ok(snapshots)
    }
}

fn verify_snapshot(snapshot: &Snapshot) -> Result<(), StorageError> {
    if codec::state_blob_checksum(&snapshot.state) != snapshot.state_checksum {
        return Err(StorageError::Corrupt(format!(
            "snapshot {} state checksum mismatch",
            snapshot.snapshot_id
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// BlobStore
// ---------------------------------------------------------------------------

impl BlobStore for MemoryBackend {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.lock().blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.lock()
            .blobs
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound)
    }
}

// ---------------------------------------------------------------------------
// LeaseStore
// ---------------------------------------------------------------------------

impl LeaseStore for MemoryBackend {
    async fn acquire(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Lease, StorageError> {
        let mut tables = self.lock();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::Query(format!("invalid ttl: {e}")))?;

        let next_token = match tables.leases.get(workflow_id) {
            Some(existing) if existing.is_live(now) => {
                return Err(StorageError::Conflict(format!(
                    "lease held by {}",
                    existing.owner_id
                )));
            }
            Some(expired) => expired.fencing_token + 1,
            None => 1,
        };

        let lease = Lease {
            workflow_id: workflow_id.to_string(),
            org_id: org_id.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at: now,
            lease_expires_at: now + ttl,
            heartbeat_at: now,
            fencing_token: next_token,
        };
        tables
            .leases
            .insert(workflow_id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StorageError> {
        let mut tables = self.lock();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::Query(format!("invalid ttl: {e}")))?;

        match tables.leases.get_mut(&lease.workflow_id) {
            Some(stored)
                if stored.owner_id == lease.owner_id
                    && stored.fencing_token == lease.fencing_token =>
            {
                stored.heartbeat_at = now;
                stored.lease_expires_at = now + ttl;
                Ok(stored.clone())
            }
            _ => Err(StorageError::Fenced(format!(
                "lease for '{}' no longer owned by {} (token {})",
                lease.workflow_id, lease.owner_id, lease.fencing_token
            ))),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StorageError> {
        let mut tables = self.lock();
        let matches = tables
            .leases
            .get(&lease.workflow_id)
            .is_some_and(|stored| {
                stored.owner_id == lease.owner_id && stored.fencing_token == lease.fencing_token
            });
        if matches {
            tables.leases.remove(&lease.workflow_id);
        }
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<Lease>, StorageError> {
        Ok(self.lock().leases.get(workflow_id).cloned())
    }
}

// ---------------------------------------------------------------------------
// IdempotencyStore
// ---------------------------------------------------------------------------

impl MemoryBackend {
    fn check_fence(tables: &Tables, workflow_id: &str, fencing_token: u64) -> Result<(), StorageError> {
        match tables.leases.get(workflow_id) {
            Some(lease) if lease.fencing_token == fencing_token => Ok(()),
            Some(lease) => Err(StorageError::Fenced(format!(
                "token {} is stale for '{}' (current {})",
                fencing_token, workflow_id, lease.fencing_token
            ))),
            None => Err(StorageError::Fenced(format!(
                "no lease held for '{workflow_id}'"
            ))),
        }
    }
}

impl IdempotencyStore for MemoryBackend {
    async fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletedStep>, StorageError> {
        let tables = self.lock();
        Ok(tables
            .completions
            .get(&(workflow_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        fencing_token: u64,
    ) -> Result<AttemptOutcome, StorageError> {
        let mut tables = self.lock();
        Self::check_fence(&tables, workflow_id, fencing_token)?;

        let key = (workflow_id.to_string(), step_id.to_string());
        if let Some(completed) = tables.completions.get(&key) {
            return Ok(AttemptOutcome::AlreadyCompleted(completed.clone()));
        }

        let attempts = tables.attempts.entry(key).or_default();
        let attempt = StepAttempt {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            attempt_id: attempts.iter().map(|a| a.attempt_id).max().unwrap_or(0) + 1,
            started_at: Utc::now(),
            fencing_token,
        };
        attempts.push(attempt.clone());
        Ok(AttemptOutcome::Attempt(attempt))
    }

    async fn mark_completed(
        &self,
        completion: CompletedStep,
        fencing_token: u64,
    ) -> Result<(), StorageError> {
        let mut tables = self.lock();
        Self::check_fence(&tables, &completion.workflow_id, fencing_token)?;

        let key = (completion.workflow_id.clone(), completion.step_id.clone());
        if tables.completions.contains_key(&key) {
            return Err(StorageError::Conflict(format!(
                "step '{}' of '{}' already completed",
                completion.step_id, completion.workflow_id
            )));
        }
        tables.completions.insert(key, completion);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use duramen_types::event::{EventPayload, StepIntentionPayload};
    use duramen_types::state::WorkflowState;
    use std::collections::HashMap as StdHashMap;

    fn intention(workflow_id: &str, step_id: &str) -> Event {
        Event::new(
            workflow_id,
            "default",
            EventPayload::StepIntention(StepIntentionPayload {
                step_id: step_id.to_string(),
                step_name: step_id.to_string(),
                attempt_id: 1,
                fencing_token: 1,
            }),
        )
    }

    fn sealed_snapshot(workflow_id: &str, last_event_seq: u64) -> Snapshot {
        let mut state = WorkflowState::initial(
            workflow_id,
            "test",
            "default",
            Utc::now(),
            &StdHashMap::new(),
        );
        state.step_number = last_event_seq / 2;
        state.checksum = codec::state_checksum(&state);
        let mut snapshot = Snapshot::capture(state, last_event_seq);
        snapshot.state_checksum = codec::state_blob_checksum(&snapshot.state);
        snapshot
    }

    // -------------------------------------------------------------------
    // Journal
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_append_assigns_contiguous_sequence() {
        let store = MemoryBackend::new();
        for expected in 1..=5u64 {
            let event = store
                .append(intention("wf-seq", &format!("s{expected}")))
                .await
                .unwrap();
            assert_eq!(event.event_seq, expected);
            assert!(codec::verify_event(&event));
        }
        let (max_seq, _) = JournalStore::tail(&store, "wf-seq").await.unwrap().unwrap();
        assert_eq!(max_seq, 5);
    }

    #[tokio::test]
    async fn test_concurrent_appenders_leave_no_gaps() {
        let store = MemoryBackend::new();
        let mut handles = Vec::new();
        for task in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    store
                        .append(intention("wf-conc", &format!("t{task}-{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let events = store.read_range("wf-conc", 1, u64::MAX).await.unwrap();
        assert_eq!(events.len(), 200);
        let seqs: Vec<u64> = events.iter().map(|e| e.event_seq).collect();
        assert_eq!(seqs, (1..=200).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_duplicate_event_id_rejected() {
        let store = MemoryBackend::new();
        let event = intention("wf-dup", "a");
        store.append(event.clone()).await.unwrap();
        let err = store.append(event).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_no_appends_after_terminal_event() {
        use duramen_types::event::WorkflowCompletedPayload;
        let store = MemoryBackend::new();
        store
            .append(Event::new(
                "wf-term",
                "default",
                EventPayload::WorkflowCompleted(WorkflowCompletedPayload {
                    final_state_checksum: "aa".repeat(32),
                }),
            ))
            .await
            .unwrap();
        let err = store.append(intention("wf-term", "late")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_read_range_bounds() {
        let store = MemoryBackend::new();
        for i in 0..6 {
            store
                .append(intention("wf-range", &format!("s{i}")))
                .await
                .unwrap();
        }
        let events = store.read_range("wf-range", 3, 5).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.event_seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert!(store.read_range("wf-missing", 1, 10).await.unwrap().is_empty());
    }

    // -------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_snapshot_put_is_idempotent_and_latest_respects_max_seq() {
        let store = MemoryBackend::new();
        let early = sealed_snapshot("wf-snap", 4);
        let late = sealed_snapshot("wf-snap", 10);
        SnapshotStore::put(&store, early.clone()).await.unwrap();
        SnapshotStore::put(&store, early.clone()).await.unwrap();
        SnapshotStore::put(&store, late.clone()).await.unwrap();

        let latest = store.get_latest("wf-snap", u64::MAX).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, late.snapshot_id);

        let bounded = store.get_latest("wf-snap", 7).await.unwrap().unwrap();
        assert_eq!(bounded.snapshot_id, early.snapshot_id);

        assert!(store.get_latest("wf-snap", 2).await.unwrap().is_none());
        assert_eq!(store.list("wf-snap").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_fails_on_read() {
        let store = MemoryBackend::new();
        let mut snapshot = sealed_snapshot("wf-corrupt", 3);
        snapshot.state_checksum = "00".repeat(32);
        SnapshotStore::put(&store, snapshot.clone()).await.unwrap();
        let err = SnapshotStore::get(&store, &snapshot.snapshot_id)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    // -------------------------------------------------------------------
    // Leases
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn test_concurrent_acquire_admits_exactly_one() {
        let store = MemoryBackend::new();
        let ttl = Duration::from_secs(30);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .acquire("wf-excl", "default", &format!("exec-{i}"), ttl)
                    .await
            }));
        }
        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(StorageError::Conflict(_)) => losers += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(losers, 7);
    }

    #[tokio::test]
    async fn test_takeover_after_expiry_increments_token() {
        let store = MemoryBackend::new();
        let short = Duration::from_millis(10);
        let lease_x = store
            .acquire("wf-fence", "default", "exec-x", short)
            .await
            .unwrap();
        assert_eq!(lease_x.fencing_token, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let lease_y = store
            .acquire("wf-fence", "default", "exec-y", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(lease_y.fencing_token, 2);

        // The fenced-out owner can no longer heartbeat or be trusted for
        // completion writes.
        let err = store
            .heartbeat(&lease_x, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fenced(_)));
        let err = MemoryBackend::check_fence(&store.lock(), "wf-fence", lease_x.fencing_token)
            .unwrap_err();
        assert!(matches!(err, StorageError::Fenced(_)));
    }

    #[tokio::test]
    async fn test_release_is_noop_on_mismatch() {
        let store = MemoryBackend::new();
        let lease = store
            .acquire("wf-rel", "default", "exec-a", Duration::from_secs(30))
            .await
            .unwrap();

        let mut stale = lease.clone();
        stale.fencing_token = 99;
        store.release(&stale).await.unwrap();
        assert!(LeaseStore::get(&store, "wf-rel").await.unwrap().is_some());

        store.release(&lease).await.unwrap();
        assert!(LeaseStore::get(&store, "wf-rel").await.unwrap().is_none());
    }

    // -------------------------------------------------------------------
    // Idempotency
    // -------------------------------------------------------------------

    async fn hold_lease(store: &MemoryBackend, workflow_id: &str) -> Lease {
        store
            .acquire(workflow_id, "default", "exec-a", Duration::from_secs(30))
            .await
            .unwrap()
    }

    fn completion(workflow_id: &str, step_id: &str, attempt_id: u32) -> CompletedStep {
        CompletedStep {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            attempt_id,
            completed_at: Utc::now(),
            result_ref: Uuid::now_v7().to_string(),
            result_checksum: "ab".repeat(32),
            org_id: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn test_attempt_ids_increment() {
        let store = MemoryBackend::new();
        let lease = hold_lease(&store, "wf-att").await;
        for expected in 1..=3u32 {
            let outcome = store
                .allocate_attempt("wf-att", "a_0", lease.fencing_token)
                .await
                .unwrap();
            match outcome {
                AttemptOutcome::Attempt(attempt) => assert_eq!(attempt.attempt_id, expected),
                other => panic!("expected attempt, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_allocate_returns_completion_when_done() {
        let store = MemoryBackend::new();
        let lease = hold_lease(&store, "wf-done").await;
        store
            .mark_completed(completion("wf-done", "a_0", 1), lease.fencing_token)
            .await
            .unwrap();

        let outcome = store
            .allocate_attempt("wf-done", "a_0", lease.fencing_token)
            .await
            .unwrap();
        assert!(matches!(outcome, AttemptOutcome::AlreadyCompleted(_)));
    }

    #[tokio::test]
    async fn test_second_completion_rejected() {
        let store = MemoryBackend::new();
        let lease = hold_lease(&store, "wf-once").await;
        store
            .mark_completed(completion("wf-once", "a_0", 1), lease.fencing_token)
            .await
            .unwrap();
        let err = store
            .mark_completed(completion("wf-once", "a_0", 2), lease.fencing_token)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_stale_token_is_fenced() {
        let store = MemoryBackend::new();
        let lease = hold_lease(&store, "wf-stale").await;
        let err = store
            .allocate_attempt("wf-stale", "a_0", lease.fencing_token + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fenced(_)));

        let err = store
            .mark_completed(completion("wf-stale", "a_0", 1), lease.fencing_token + 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fenced(_)));
    }
}
