//! Persistence backends for the Duramen workflow core.
//!
//! Implements the store traits defined in `duramen-core`: SQLite storage
//! over sqlx with a split reader/writer pool, and a local-filesystem blob
//! store for snapshot states above the inline threshold.

pub mod blob;
pub mod sqlite;

use duramen_core::{Engine, EngineConfig};
use duramen_types::error::StorageError;

use blob::FilesystemBlobStore;
use sqlite::idempotency::SqliteIdempotencyStore;
use sqlite::journal::SqliteJournalStore;
use sqlite::lease::SqliteLeaseStore;
use sqlite::pool::DatabasePool;
use sqlite::snapshot::SqliteSnapshotStore;

/// Engine over the SQLite backend with filesystem blob spill.
pub type SqliteEngine = Engine<
    SqliteJournalStore,
    SqliteSnapshotStore<FilesystemBlobStore>,
    SqliteLeaseStore,
    SqliteIdempotencyStore,
>;

/// Open (creating if missing) a SQLite-backed engine. `blob_dir` receives
/// snapshot states above the inline threshold.
pub async fn open_sqlite_engine(
    database_url: &str,
    blob_dir: impl Into<std::path::PathBuf>,
    config: EngineConfig,
) -> Result<SqliteEngine, StorageError> {
    let pool = DatabasePool::new(database_url)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;
    let blobs = FilesystemBlobStore::new(blob_dir);
    Ok(Engine::new(
        SqliteJournalStore::new(pool.clone()),
        SqliteSnapshotStore::new(pool.clone(), blobs),
        SqliteLeaseStore::new(pool.clone()),
        SqliteIdempotencyStore::new(pool),
        config,
    ))
}
