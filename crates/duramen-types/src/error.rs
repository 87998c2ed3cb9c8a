use thiserror::Error;

/// Errors from persistence operations (used by the store traits in
/// `duramen-core`). Backends map their driver errors onto this enum so the
/// engine can distinguish retryable faults from constraint violations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("record not found")]
    NotFound,

    /// A uniqueness or compare-and-set constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller's fencing token no longer matches the stored lease.
    #[error("fenced: {0}")]
    Fenced(String),

    /// An integrity check (checksum, sequence) failed on read.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(String),
}
