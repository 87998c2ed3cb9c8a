//! Durable workflow execution core.
//!
//! Four tightly-coupled subsystems make workflows survive crashes,
//! restarts, and executor failover while keeping side-effecting steps
//! exactly-once at commit:
//!
//! - an append-only event journal with per-workflow monotonic sequencing
//!   and SHA-256 integrity stamps,
//! - a snapshot store interleaved with the journal for fast restore,
//! - a lease manager issuing fencing tokens so exactly one executor runs
//!   a workflow at a time,
//! - an execution engine enforcing write-ahead-intention /
//!   at-most-once-effect / exactly-once-commit discipline over user steps
//!   and rebuilding state deterministically on resume.
//!
//! Persistence is a trait boundary ([`store`]); the in-memory reference
//! backend ships here and the SQLite backend lives in `duramen-infra`.

pub mod codec;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;

pub use config::EngineConfig;
pub use engine::context::WorkflowContext;
pub use engine::recovery::{Recovery, RestoredState};
pub use engine::{Engine, MemoryEngine};
pub use error::EngineError;
pub use store::memory::MemoryBackend;
pub use store::{
    AttemptOutcome, BlobStore, IdempotencyStore, JournalStore, LeaseStore, SnapshotStore,
};
