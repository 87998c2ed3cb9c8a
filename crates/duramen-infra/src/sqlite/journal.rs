//! SQLite journal store: append-only events with atomic per-workflow
//! sequence assignment.
//!
//! Append runs on the single-connection writer pool inside a transaction:
//! read the current maximum `event_seq`, assign the next integer,
//! recompute the checksum, insert. The `(workflow_id, event_seq)` primary
//! key and the unique `event_id` catch any race; a sequence conflict
//! restarts the append rather than skipping. Reads verify every event's
//! checksum and surface corruption rather than smoothing it over.

use sqlx::Row;
use uuid::Uuid;

use duramen_core::JournalStore;
use duramen_core::codec;
use duramen_types::error::StorageError;
use duramen_types::event::{Event, EventPayload, EventType};

use super::pool::DatabasePool;
use super::{map_sqlx, parse_datetime, parse_uuid};

/// How many sequence-conflict restarts an append tolerates before giving
/// up. With a single writer connection this should never trip.
const APPEND_RETRIES: u32 = 3;

/// SQLite-backed implementation of `JournalStore`.
pub struct SqliteJournalStore {
    pool: DatabasePool,
}

impl SqliteJournalStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn event_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Event, StorageError> {
    let event_type_str: String = row.try_get("event_type").map_err(map_sqlx)?;
    let event_type = EventType::parse(&event_type_str)
        .ok_or_else(|| StorageError::Corrupt(format!("unknown event type '{event_type_str}'")))?;

    let payload_str: String = row.try_get("payload").map_err(map_sqlx)?;
    let payload_value: serde_json::Value = serde_json::from_str(&payload_str)
        .map_err(|e| StorageError::Corrupt(format!("invalid payload JSON: {e}")))?;
    let payload = EventPayload::from_value(event_type, payload_value)
        .map_err(|e| StorageError::Corrupt(format!("payload does not match {event_type}: {e}")))?;

    let event_id: String = row.try_get("event_id").map_err(map_sqlx)?;
    let timestamp: String = row.try_get("timestamp").map_err(map_sqlx)?;
    let event_seq: i64 = row.try_get("event_seq").map_err(map_sqlx)?;

    let event = Event {
        event_id: parse_uuid(&event_id)?,
        workflow_id: row.try_get("workflow_id").map_err(map_sqlx)?,
        org_id: row.try_get("org_id").map_err(map_sqlx)?,
        event_seq: event_seq as u64,
        payload,
        timestamp: parse_datetime(&timestamp)?,
        schema_version: row.try_get("schema_version").map_err(map_sqlx)?,
        producer_version: row.try_get("producer_version").map_err(map_sqlx)?,
        checksum: row.try_get("checksum").map_err(map_sqlx)?,
    };

    if !codec::verify_event(&event) {
        return Err(StorageError::Corrupt(format!(
            "event {} (seq {}) failed checksum verification",
            event.event_id, event.event_seq
        )));
    }
    Ok(event)
}

impl JournalStore for SqliteJournalStore {
    async fn append(&self, mut event: Event) -> Result<Event, StorageError> {
        for _ in 0..APPEND_RETRIES {
            let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;

            let last = sqlx::query(
                "SELECT event_seq, event_type FROM events
                 WHERE workflow_id = ? ORDER BY event_seq DESC LIMIT 1",
            )
            .bind(&event.workflow_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            let max_seq = match &last {
                Some(row) => {
                    let last_type: String = row.try_get("event_type").map_err(map_sqlx)?;
                    if EventType::parse(&last_type).is_some_and(|ty| ty.is_terminal()) {
                        return Err(StorageError::Conflict(format!(
                            "workflow '{}' already has terminal event {last_type}",
                            event.workflow_id
                        )));
                    }
                    let seq: i64 = row.try_get("event_seq").map_err(map_sqlx)?;
                    seq
                }
                None => 0,
            };

            event.event_seq = (max_seq + 1) as u64;
            event.checksum = codec::event_checksum(&event);

            let inserted = sqlx::query(
                "INSERT INTO events (workflow_id, event_seq, event_id, event_type, payload,
                                     timestamp, schema_version, producer_version, checksum, org_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&event.workflow_id)
            .bind(event.event_seq as i64)
            .bind(event.event_id.to_string())
            .bind(event.event_type().as_str())
            .bind(codec::to_canonical_json(&event.payload.to_value()))
            .bind(codec::canonical_timestamp(&event.timestamp))
            .bind(&event.schema_version)
            .bind(&event.producer_version)
            .bind(&event.checksum)
            .bind(&event.org_id)
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    tx.commit().await.map_err(map_sqlx)?;
                    return Ok(event);
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    // A duplicate event_id can never succeed; a sequence
                    // collision restarts with a fresh read.
                    if db.message().contains("event_id") {
                        return Err(StorageError::Conflict(format!(
                            "event id {} already exists",
                            event.event_id
                        )));
                    }
                    drop(tx);
                    tracing::debug!(
                        workflow_id = event.workflow_id.as_str(),
                        seq = event.event_seq,
                        "sequence conflict on append; restarting"
                    );
                    continue;
                }
                Err(err) => return Err(map_sqlx(err)),
            }
        }
        Err(StorageError::Conflict(format!(
            "append to '{}' kept colliding on event_seq",
            event.workflow_id
        )))
    }

    async fn read_range(
        &self,
        workflow_id: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<Event>, StorageError> {
        let from = from_seq.min(i64::MAX as u64) as i64;
        let to = to_seq.min(i64::MAX as u64) as i64;
        let rows = sqlx::query(
            "SELECT workflow_id, event_seq, event_id, event_type, payload, timestamp,
                    schema_version, producer_version, checksum, org_id
             FROM events
             WHERE workflow_id = ? AND event_seq BETWEEN ? AND ?
             ORDER BY event_seq ASC",
        )
        .bind(workflow_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(event_from_row).collect()
    }

    async fn tail(&self, workflow_id: &str) -> Result<Option<(u64, Uuid)>, StorageError> {
        let row = sqlx::query(
            "SELECT event_seq, event_id FROM events
             WHERE workflow_id = ? ORDER BY event_seq DESC LIMIT 1",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        row.map(|row| {
            let seq: i64 = row.try_get("event_seq").map_err(map_sqlx)?;
            let id: String = row.try_get("event_id").map_err(map_sqlx)?;
            Ok((seq as u64, parse_uuid(&id)?))
        })
        .transpose()
    }
}
