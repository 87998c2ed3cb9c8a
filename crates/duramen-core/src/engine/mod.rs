//! The execution engine: store handles, per-run context, recovery, the
//! step protocol, and the workflow runtime.

pub mod context;
pub mod recovery;
pub(crate) mod runtime;
mod step;

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::store::memory::MemoryBackend;
use crate::store::{IdempotencyStore, JournalStore, LeaseStore, SnapshotStore};

use recovery::Recovery;

/// The durable workflow engine, generic over its four persistence
/// backends. Cheap to clone; clones share the same stores and executor
/// identity.
pub struct Engine<J, S, L, I> {
    pub(crate) inner: Arc<EngineInner<J, S, L, I>>,
}

pub(crate) struct EngineInner<J, S, L, I> {
    pub(crate) journal: J,
    pub(crate) snapshots: S,
    pub(crate) leases: L,
    pub(crate) idempotency: I,
    pub(crate) config: EngineConfig,
    pub(crate) executor_id: String,
    /// Cancellation tokens for runs executing in this process, keyed by
    /// workflow id. Lets `Cancel` reach in-flight steps without waiting
    /// for the next heartbeat poll.
    pub(crate) cancellations: DashMap<String, CancellationToken>,
}

impl<J, S, L, I> Clone for Engine<J, S, L, I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<J, S, L, I> Engine<J, S, L, I>
where
    J: JournalStore,
    S: SnapshotStore,
    L: LeaseStore,
    I: IdempotencyStore,
{
    /// Build an engine over the given backends. The executor identity is
    /// generated per engine instance and becomes the lease `owner_id`.
    pub fn new(journal: J, snapshots: S, leases: L, idempotency: I, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                journal,
                snapshots,
                leases,
                idempotency,
                config,
                executor_id: format!("exec-{}", Uuid::now_v7().simple()),
                cancellations: DashMap::new(),
            }),
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.inner.executor_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub(crate) fn recovery(&self) -> Recovery<'_, J, S> {
        Recovery::new(&self.inner.journal, &self.inner.snapshots)
    }
}

/// Engine over the in-memory reference backend.
pub type MemoryEngine = Engine<MemoryBackend, MemoryBackend, MemoryBackend, MemoryBackend>;

impl MemoryEngine {
    /// Engine with all four stores backed by one shared in-memory table
    /// set. Useful for tests and ephemeral embedding.
    pub fn in_memory(config: EngineConfig) -> Self {
        let backend = MemoryBackend::new();
        Self::new(
            backend.clone(),
            backend.clone(),
            backend.clone(),
            backend,
            config,
        )
    }
}
