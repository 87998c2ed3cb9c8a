//! SQLite snapshot store with inline/external-blob split.
//!
//! States at or above the inline threshold are written to the blob store
//! first and verified by read-back before the metadata row is inserted, so
//! an orphan row without its blob is never created. Reads resolve the
//! state (inline or external), verify the blob checksum, and decode.

use sqlx::Row;
use uuid::Uuid;

use duramen_core::codec;
use duramen_core::{BlobStore, SnapshotStore};
use duramen_types::error::StorageError;
use duramen_types::snapshot::{DEFAULT_INLINE_THRESHOLD, Snapshot};
use duramen_types::state::WorkflowState;

use super::pool::DatabasePool;
use super::{map_sqlx, parse_datetime, parse_uuid};

/// SQLite-backed implementation of `SnapshotStore`, generic over the blob
/// store used for oversized states.
pub struct SqliteSnapshotStore<B> {
    pool: DatabasePool,
    blobs: B,
    inline_threshold: usize,
}

impl<B: BlobStore> SqliteSnapshotStore<B> {
    pub fn new(pool: DatabasePool, blobs: B) -> Self {
        Self {
            pool,
            blobs,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }

    pub fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    fn blob_key(snapshot: &Snapshot) -> String {
        format!(
            "snapshots/{}/{}.json",
            snapshot.workflow_id, snapshot.snapshot_id
        )
    }

    async fn resolve_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Snapshot, StorageError> {
        let snapshot_id: String = row.try_get("snapshot_id").map_err(map_sqlx)?;
        let state_checksum: String = row.try_get("state_checksum").map_err(map_sqlx)?;
        let inline: Option<String> = row.try_get("state_inline").map_err(map_sqlx)?;
        let external: Option<String> = row.try_get("state_external_ref").map_err(map_sqlx)?;

        let blob = match (inline, external) {
            (Some(blob), _) => blob,
            (None, Some(key)) => {
                let bytes = self.blobs.get(&key).await?;
                String::from_utf8(bytes).map_err(|e| {
                    StorageError::Corrupt(format!("snapshot blob {key} is not UTF-8: {e}"))
                })?
            }
            (None, None) => {
                return Err(StorageError::Corrupt(format!(
                    "snapshot {snapshot_id} has neither inline state nor blob reference"
                )));
            }
        };

        if codec::sha256_hex(&blob) != state_checksum {
            return Err(StorageError::Corrupt(format!(
                "snapshot {snapshot_id} state checksum mismatch"
            )));
        }

        let state: WorkflowState = serde_json::from_str(&blob)
            .map_err(|e| StorageError::Corrupt(format!("snapshot {snapshot_id} state: {e}")))?;

        let step_number: i64 = row.try_get("step_number").map_err(map_sqlx)?;
        let last_event_seq: i64 = row.try_get("last_event_seq").map_err(map_sqlx)?;
        let created_at: String = row.try_get("created_at").map_err(map_sqlx)?;

        Ok(Snapshot {
            snapshot_id: parse_uuid(&snapshot_id)?,
            workflow_id: row.try_get("workflow_id").map_err(map_sqlx)?,
            org_id: row.try_get("org_id").map_err(map_sqlx)?,
            step_number: step_number as u64,
            last_event_seq: last_event_seq as u64,
            state,
            state_checksum,
            created_at: parse_datetime(&created_at)?,
        })
    }
}

const SELECT_COLUMNS: &str = "snapshot_id, workflow_id, org_id, step_number, last_event_seq, \
                              state_inline, state_external_ref, state_checksum, created_at";

impl<B: BlobStore> SnapshotStore for SqliteSnapshotStore<B> {
    async fn put(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let blob = codec::state_blob(&snapshot.state);
        if codec::sha256_hex(&blob) != snapshot.state_checksum {
            return Err(StorageError::Corrupt(format!(
                "snapshot {} was handed an unsealed state checksum",
                snapshot.snapshot_id
            )));
        }

        let (inline, external) = if blob.len() < self.inline_threshold {
            (Some(blob), None)
        } else {
            // External blob first, then verify by read-back, then the row.
            let key = Self::blob_key(&snapshot);
            self.blobs.put(&key, blob.as_bytes()).await?;
            let readback = self.blobs.get(&key).await?;
            if codec::sha256_hex(&String::from_utf8_lossy(&readback)) != snapshot.state_checksum {
                return Err(StorageError::Io(format!(
                    "blob read-back verification failed for {key}"
                )));
            }
            (None, Some(key))
        };

        // Idempotent with respect to snapshot_id.
        sqlx::query(
            "INSERT INTO snapshots (snapshot_id, workflow_id, org_id, step_number,
                                    last_event_seq, state_inline, state_external_ref,
                                    state_checksum, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(snapshot_id) DO NOTHING",
        )
        .bind(snapshot.snapshot_id.to_string())
        .bind(&snapshot.workflow_id)
        .bind(&snapshot.org_id)
        .bind(snapshot.step_number as i64)
        .bind(snapshot.last_event_seq as i64)
        .bind(inline)
        .bind(external)
        .bind(&snapshot.state_checksum)
        .bind(codec::canonical_timestamp(&snapshot.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        tracing::debug!(
            workflow_id = snapshot.workflow_id.as_str(),
            snapshot_id = %snapshot.snapshot_id,
            last_event_seq = snapshot.last_event_seq,
            "snapshot persisted"
        );
        Ok(())
    }

    async fn get(&self, snapshot_id: &Uuid) -> Result<Option<Snapshot>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM snapshots WHERE snapshot_id = ?"
        ))
        .bind(snapshot_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => Ok(Some(self.resolve_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn get_latest(
        &self,
        workflow_id: &str,
        max_seq: u64,
    ) -> Result<Option<Snapshot>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM snapshots
             WHERE workflow_id = ? AND last_event_seq <= ?
             ORDER BY last_event_seq DESC LIMIT 1"
        ))
        .bind(workflow_id)
        .bind(max_seq.min(i64::MAX as u64) as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => Ok(Some(self.resolve_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self, workflow_id: &str) -> Result<Vec<Snapshot>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM snapshots
             WHERE workflow_id = ? ORDER BY last_event_seq DESC"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in &rows {
            snapshots.push(self.resolve_row(row).await?);
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FilesystemBlobStore;
    use chrono::Utc;
    use std::collections::HashMap;

    async fn store() -> (tempfile::TempDir, SqliteSnapshotStore<FilesystemBlobStore>) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("s.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let blobs = FilesystemBlobStore::new(dir.path().join("blobs"));
        (dir, SqliteSnapshotStore::new(pool, blobs))
    }

    fn sealed_snapshot(workflow_id: &str, last_event_seq: u64, filler: usize) -> Snapshot {
        let mut state = WorkflowState::initial(
            workflow_id,
            "snapshot-test",
            "default",
            Utc::now(),
            &HashMap::new(),
        );
        if filler > 0 {
            state.variables.insert(
                "filler".to_string(),
                serde_json::Value::String("x".repeat(filler)),
            );
        }
        state.checksum = codec::state_checksum(&state);
        let mut snapshot = Snapshot::capture(state, last_event_seq);
        snapshot.state_checksum = codec::state_blob_checksum(&snapshot.state);
        snapshot
    }

    #[tokio::test]
    async fn test_inline_roundtrip() {
        let (_dir, store) = store().await;
        let snapshot = sealed_snapshot("wf-s", 4, 0);
        store.put(snapshot.clone()).await.unwrap();

        let loaded = store.get(&snapshot.snapshot_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, snapshot.state);
        assert_eq!(loaded.last_event_seq, 4);
    }

    #[tokio::test]
    async fn test_oversized_state_spills_to_blob_store() {
        let (dir, store) = store().await;
        let store = store.with_inline_threshold(1024);
        let snapshot = sealed_snapshot("wf-big", 6, 8 * 1024);
        store.put(snapshot.clone()).await.unwrap();

        // The row must carry a blob reference, not inline state.
        let row = sqlx::query("SELECT state_inline, state_external_ref FROM snapshots WHERE snapshot_id = ?")
            .bind(snapshot.snapshot_id.to_string())
            .fetch_one(&store.pool.reader)
            .await
            .unwrap();
        let inline: Option<String> = row.try_get("state_inline").unwrap();
        let external: Option<String> = row.try_get("state_external_ref").unwrap();
        assert!(inline.is_none());
        let key = external.expect("external ref recorded");
        assert!(dir.path().join("blobs").join(&key).exists());

        let loaded = store.get(&snapshot.snapshot_id).await.unwrap().unwrap();
        assert_eq!(loaded.state, snapshot.state);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (_dir, store) = store().await;
        let snapshot = sealed_snapshot("wf-i", 2, 0);
        store.put(snapshot.clone()).await.unwrap();
        store.put(snapshot.clone()).await.unwrap();
        assert_eq!(store.list("wf-i").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_latest_respects_max_seq() {
        let (_dir, store) = store().await;
        let early = sealed_snapshot("wf-l", 3, 0);
        let late = sealed_snapshot("wf-l", 9, 0);
        store.put(early.clone()).await.unwrap();
        store.put(late.clone()).await.unwrap();

        let latest = store.get_latest("wf-l", u64::MAX).await.unwrap().unwrap();
        assert_eq!(latest.snapshot_id, late.snapshot_id);
        let bounded = store.get_latest("wf-l", 5).await.unwrap().unwrap();
        assert_eq!(bounded.snapshot_id, early.snapshot_id);
        assert!(store.get_latest("wf-l", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsealed_snapshot_rejected() {
        let (_dir, store) = store().await;
        let mut snapshot = sealed_snapshot("wf-u", 2, 0);
        snapshot.state_checksum = "00".repeat(32);
        let err = store.put(snapshot).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_tampered_inline_state_fails_on_read() {
        let (_dir, store) = store().await;
        let snapshot = sealed_snapshot("wf-tamper", 2, 0);
        store.put(snapshot.clone()).await.unwrap();

        sqlx::query("UPDATE snapshots SET state_inline = ? WHERE snapshot_id = ?")
            .bind("{\"forged\":true}")
            .bind(snapshot.snapshot_id.to_string())
            .execute(&store.pool.writer)
            .await
            .unwrap();

        let err = store.get(&snapshot.snapshot_id).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }
}
