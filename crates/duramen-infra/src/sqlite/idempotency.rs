//! SQLite idempotency store: per-(workflow, step) attempt allocation and
//! the unique completion record.
//!
//! Both write operations validate the caller's fencing token against the
//! current lease row inside the same transaction, so writes from an
//! evicted executor are refused at the storage boundary. The
//! `(workflow_id, step_id)` primary key on completions enforces
//! exactly-once commit.

use chrono::Utc;
use sqlx::Row;

use duramen_core::store::AttemptOutcome;
use duramen_core::IdempotencyStore;
use duramen_types::error::StorageError;
use duramen_types::step::{CompletedStep, StepAttempt};

use super::pool::DatabasePool;
use super::{map_sqlx, parse_datetime};

/// SQLite-backed implementation of `IdempotencyStore`.
pub struct SqliteIdempotencyStore {
    pool: DatabasePool,
}

impl SqliteIdempotencyStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn completion_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CompletedStep, StorageError> {
    let attempt_id: i64 = row.try_get("attempt_id").map_err(map_sqlx)?;
    let completed_at: String = row.try_get("completed_at").map_err(map_sqlx)?;
    Ok(CompletedStep {
        workflow_id: row.try_get("workflow_id").map_err(map_sqlx)?,
        step_id: row.try_get("step_id").map_err(map_sqlx)?,
        attempt_id: attempt_id as u32,
        completed_at: parse_datetime(&completed_at)?,
        result_ref: row.try_get("result_snapshot_ref").map_err(map_sqlx)?,
        result_checksum: row.try_get("result_checksum").map_err(map_sqlx)?,
        org_id: row.try_get("org_id").map_err(map_sqlx)?,
    })
}

async fn check_fence(
    tx: &mut sqlx::SqliteConnection,
    workflow_id: &str,
    fencing_token: u64,
) -> Result<(), StorageError> {
    let row = sqlx::query("SELECT fencing_token FROM workflow_leases WHERE workflow_id = ?")
        .bind(workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

    match row {
        Some(row) => {
            let current: i64 = row.try_get("fencing_token").map_err(map_sqlx)?;
            if current as u64 != fencing_token {
                return Err(StorageError::Fenced(format!(
                    "token {fencing_token} is stale for '{workflow_id}' (current {current})"
                )));
            }
            Ok(())
        }
        None => Err(StorageError::Fenced(format!(
            "no lease held for '{workflow_id}'"
        ))),
    }
}

impl IdempotencyStore for SqliteIdempotencyStore {
    async fn check_completed(
        &self,
        workflow_id: &str,
        step_id: &str,
    ) -> Result<Option<CompletedStep>, StorageError> {
        let row = sqlx::query(
            "SELECT workflow_id, step_id, attempt_id, completed_at, result_snapshot_ref,
                    result_checksum, org_id
             FROM completed_steps WHERE workflow_id = ? AND step_id = ?",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(map_sqlx)?;

        row.as_ref().map(completion_from_row).transpose()
    }

    async fn allocate_attempt(
        &self,
        workflow_id: &str,
        step_id: &str,
        fencing_token: u64,
    ) -> Result<AttemptOutcome, StorageError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;
        check_fence(&mut *tx, workflow_id, fencing_token).await?;

        let completed = sqlx::query(
            "SELECT workflow_id, step_id, attempt_id, completed_at, result_snapshot_ref,
                    result_checksum, org_id
             FROM completed_steps WHERE workflow_id = ? AND step_id = ?",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        if let Some(row) = completed {
            return Ok(AttemptOutcome::AlreadyCompleted(completion_from_row(&row)?));
        }

        let max_attempt: i64 = sqlx::query(
            "SELECT COALESCE(MAX(attempt_id), 0) AS max_attempt
             FROM step_attempts WHERE workflow_id = ? AND step_id = ?",
        )
        .bind(workflow_id)
        .bind(step_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx)?
        .try_get("max_attempt")
        .map_err(map_sqlx)?;

        let attempt = StepAttempt {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            attempt_id: max_attempt as u32 + 1,
            started_at: Utc::now(),
            fencing_token,
        };

        sqlx::query(
            "INSERT INTO step_attempts (workflow_id, step_id, attempt_id, started_at, fencing_token)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&attempt.workflow_id)
        .bind(&attempt.step_id)
        .bind(attempt.attempt_id as i64)
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.fencing_token as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;

        Ok(AttemptOutcome::Attempt(attempt))
    }

    async fn mark_completed(
        &self,
        completion: CompletedStep,
        fencing_token: u64,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.writer.begin().await.map_err(map_sqlx)?;
        check_fence(&mut *tx, &completion.workflow_id, fencing_token).await?;

        sqlx::query(
            "INSERT INTO completed_steps (workflow_id, step_id, attempt_id, completed_at,
                                          result_snapshot_ref, result_checksum, org_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&completion.workflow_id)
        .bind(&completion.step_id)
        .bind(completion.attempt_id as i64)
        .bind(completion.completed_at.to_rfc3339())
        .bind(&completion.result_ref)
        .bind(&completion.result_checksum)
        .bind(&completion.org_id)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}
