//! SQLite persistence via sqlx: split read/write pools in WAL mode, one
//! store per core trait.

pub mod idempotency;
pub mod journal;
pub mod lease;
pub mod pool;
pub mod snapshot;

use duramen_types::error::StorageError;

/// Map a sqlx error onto the storage error taxonomy.
pub(crate) fn map_sqlx(err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Connection(err.to_string())
        }
        _ => StorageError::Query(err.to_string()),
    }
}

pub(crate) fn parse_datetime(
    s: &str,
) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StorageError::Corrupt(format!("invalid datetime '{s}': {e}")))
}

pub(crate) fn parse_uuid(s: &str) -> Result<uuid::Uuid, StorageError> {
    s.parse::<uuid::Uuid>()
        .map_err(|e| StorageError::Corrupt(format!("invalid UUID '{s}': {e}")))
}
