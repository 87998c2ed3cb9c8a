//! SQLite lease store: single-owner admission with fencing tokens.
//!
//! Acquire runs on the writer pool inside a transaction: insert a fresh
//! row, or take over an expired one with `fencing_token + 1`; a live lease
//! held by anyone else is a conflict. Heartbeat and release are guarded by
//! the `(workflow_id, owner_id, fencing_token)` three-way match, so an
//! evicted owner's writes change nothing.

use std::time::Duration;

use chrono::Utc;
use sqlx::Row;

use duramen_core::LeaseStore;
use duramen_types::error::StorageError;
use duramen_types::lease::Lease;

use super::pool::DatabasePool;
use super::{map_sqlx, parse_datetime};

/// SQLite-backed implementation of `LeaseStore`.
pub struct SqliteLeaseStore {
    pool: DatabasePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn lease_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Lease, StorageError> {
    let acquired_at: String = row.try_get("acquired_at").map_err(map_sqlx)?;
    let lease_expires_at: String = row.try_get("lease_expires_at").map_err(map_sqlx)?;
    let heartbeat_at: String = row.try_get("heartbeat_at").map_err(map_sqlx)?;
    let fencing_token: i64 = row.try_get("fencing_token").map_err(map_sqlx)?;

    Ok(Lease {
        workflow_id: row.try_get("workflow_id").map_err(map_sqlx)?,
        org_id: row.try_get("org_id").map_err(map_sqlx)?,
        owner_id: row.try_get("owner_id").map_err(map_sqlx)?,
        acquired_at: parse_datetime(&acquired_at)?,
        lease_expires_at: parse_datetime(&lease_expires_at)?,
        heartbeat_at: parse_datetime(&heartbeat_at)?,
        fencing_token: fencing_token as u64,
    })
}

fn chrono_ttl(ttl: Duration) -> Result<chrono::Duration, StorageError> {
    chrono::Duration::from_std(ttl).map_err(|e| StorageError::Query(format!("invalid ttl: {e}")))
}

impl LeaseStore for SqliteLeaseStore {
    async fn acquire(
        &self,
        workflow_id: &str,
        org_id: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Lease, StorageError> {
        let now = Utc::now();
        let expires = now + chrono_ttl(ttl)?;

        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;
        let existing = sqlx::query(
            "SELECT workflow_id, org_id, owner_id, acquired_at, lease_expires_at,
                    heartbeat_at, fencing_token
             FROM workflow_leases WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let next_token = match existing {
            Some(row) => {
                let current = lease_from_row(&row)?;
                if current.is_live(now) {
                    return Err(StorageError::Conflict(format!(
                        "lease held by {}",
                        current.owner_id
                    )));
                }
                // Expired: take over with a strictly larger token.
                sqlx::query(
                    "UPDATE workflow_leases
                     SET org_id = ?, owner_id = ?, acquired_at = ?, lease_expires_at = ?,
                         heartbeat_at = ?, fencing_token = fencing_token + 1
                     WHERE workflow_id = ?",
                )
                .bind(org_id)
                .bind(owner_id)
                .bind(now.to_rfc3339())
                .bind(expires.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(workflow_id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                current.fencing_token + 1
            }
            None => {
                sqlx::query(
                    "INSERT INTO workflow_leases
                         (workflow_id, org_id, owner_id, acquired_at, lease_expires_at,
                          heartbeat_at, fencing_token)
                     VALUES (?, ?, ?, ?, ?, ?, 1)",
                )
                .bind(workflow_id)
                .bind(org_id)
                .bind(owner_id)
                .bind(now.to_rfc3339())
                .bind(expires.to_rfc3339())
                .bind(now.to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
                1
            }
        };
        tx.commit().await.map_err(map_sqlx)?;

        tracing::debug!(
            workflow_id,
            owner_id,
            fencing_token = next_token,
            "lease acquired"
        );
        Ok(Lease {
            workflow_id: workflow_id.to_string(),
            org_id: org_id.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at: now,
            lease_expires_at: expires,
            heartbeat_at: now,
            fencing_token: next_token,
        })
    }

    async fn heartbeat(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StorageError> {
        let now = Utc::now();
        let expires = now + chrono_ttl(ttl)?;

        let updated = sqlx::query(
            "UPDATE workflow_leases
             SET heartbeat_at = ?, lease_expires_at = ?
             WHERE workflow_id = ? AND owner_id = ? AND fencing_token = ?",
        )
        .bind(now.to_rfc3339())
        .bind(expires.to_rfc3339())
        .bind(&lease.workflow_id)
        .bind(&lease.owner_id)
        .bind(lease.fencing_token as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;

        if updated.rows_affected() == 0 {
            return Err(StorageError::Fenced(format!(
                "lease for '{}' no longer owned by {} (token {})",
                lease.workflow_id, lease.owner_id, lease.fencing_token
            )));
        }

        let mut renewed = lease.clone();
        renewed.heartbeat_at = now;
        renewed.lease_expires_at = expires;
        Ok(renewed)
    }

    async fn release(&self, lease: &Lease) -> Result<(), StorageError> {
        // A mismatch means the lease was already reclaimed; deleting
        // nothing is the correct outcome.
        sqlx::query(
            "DELETE FROM workflow_leases
             WHERE workflow_id = ? AND owner_id = ? AND fencing_token = ?",
        )
        .bind(&lease.workflow_id)
        .bind(&lease.owner_id)
        .bind(lease.fencing_token as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get(&self, workflow_id: &str) -> Result<Option<Lease>, StorageError> {
        let row = sqlx::query(
            "SELECT workflow_id, org_id, owner_id, acquired_at, lease_expires_at,
                    heartbeat_at, fencing_token
             FROM workflow_leases WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(lease_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SqliteLeaseStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("l.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteLeaseStore::new(pool))
    }

    #[tokio::test]
    async fn test_acquire_then_conflict_while_live() {
        let (_dir, store) = store().await;
        let lease = store
            .acquire("wf-1", "default", "exec-a", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(lease.fencing_token, 1);

        let err = store
            .acquire("wf-1", "default", "exec-b", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_takeover_after_expiry_bumps_token_and_fences() {
        let (_dir, store) = store().await;
        let stale = store
            .acquire("wf-2", "default", "exec-a", Duration::from_millis(10))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = store
            .acquire("wf-2", "default", "exec-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(fresh.fencing_token, stale.fencing_token + 1);

        let err = store
            .heartbeat(&stale, Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Fenced(_)));

        let renewed = store
            .heartbeat(&fresh, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(renewed.lease_expires_at > fresh.acquired_at);
    }

    #[tokio::test]
    async fn test_release_requires_three_way_match() {
        let (_dir, store) = store().await;
        let lease = store
            .acquire("wf-3", "default", "exec-a", Duration::from_secs(30))
            .await
            .unwrap();

        let mut stale = lease.clone();
        stale.fencing_token += 1;
        store.release(&stale).await.unwrap();
        assert!(store.get("wf-3").await.unwrap().is_some());

        store.release(&lease).await.unwrap();
        assert!(store.get("wf-3").await.unwrap().is_none());
    }
}
