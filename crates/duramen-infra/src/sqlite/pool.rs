//! SQLite connection handling shared by the workflow stores.
//!
//! Every store hangs off one `DatabasePool`. Writes funnel through a
//! single connection, which is what lets journal sequence assignment and
//! the lease compare-and-set updates serialize without table locks; reads
//! get a wider pool so recovery replay and status queries do not queue
//! behind appends. WAL mode keeps those readers from blocking the writer.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Width of the reader pool. Restore, status, and savepoint listings are
/// read-heavy but short; eight connections covers them comfortably.
const READER_CONNECTIONS: u32 = 8;

/// How long a connection waits on a locked database before erroring.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the reader and writer pools.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

/// Connection options common to both pools: WAL, enforced foreign keys
/// (completions reference their attempts), and a busy timeout.
fn base_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true))
}

impl DatabasePool {
    /// Open the database (creating it if missing) and bring its schema up
    /// to date.
    ///
    /// The writer opens first and migrations run on it; the reader pool is
    /// read-only, so it can only open once the tables exist.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = base_options(database_url)?;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        Ok(Self { reader, writer })
    }
}

/// Database URL used when the caller does not configure one:
/// `$DURAMEN_DATA_DIR/duramen.db`, with the data dir defaulting to
/// `~/.duramen`.
pub fn default_database_url() -> String {
    let data_dir = std::env::var("DURAMEN_DATA_DIR").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/.duramen")
    });
    format!("sqlite://{data_dir}/duramen.db")
}
