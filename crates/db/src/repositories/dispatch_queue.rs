use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;
use tracing::debug;

use tollgate_core::domain::approval::{ApprovalRequestId, EntityType};
use tollgate_core::domain::dispatch::{
    CompletionOutcome, DispatchTask, DispatchTaskId, DispatchTaskState,
};
use tollgate_core::ports::{DispatchQueue, StoreError};

use super::{
    encode_optional_timestamp, encode_timestamp, parse_enum, parse_optional_timestamp,
    parse_timestamp, parse_u32, RepositoryError,
};
use crate::DbPool;

const TASK_COLUMNS: &str = "id,
    request_id,
    entity_type,
    entity_id,
    outcome,
    actor_id,
    reason,
    state,
    retry_count,
    max_retries,
    available_at,
    claimed_by,
    claimed_at,
    last_error,
    created_at,
    updated_at";

pub struct SqlDispatchQueueRepository {
    pool: DbPool,
}

impl SqlDispatchQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find(&self, id: &DispatchTaskId) -> Result<Option<DispatchTask>, RepositoryError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM completion_dispatch_queue WHERE id = ?");
        let row = sqlx::query(&sql).bind(&id.0).fetch_optional(&self.pool).await?;
        row.map(task_from_row).transpose()
    }

    async fn upsert(&self, task: &DispatchTask) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO completion_dispatch_queue (
                id,
                request_id,
                entity_type,
                entity_id,
                outcome,
                actor_id,
                reason,
                state,
                retry_count,
                max_retries,
                available_at,
                claimed_by,
                claimed_at,
                last_error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                retry_count = excluded.retry_count,
                max_retries = excluded.max_retries,
                available_at = excluded.available_at,
                claimed_by = excluded.claimed_by,
                claimed_at = excluded.claimed_at,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(&task.id.0)
        .bind(&task.request_id.0)
        .bind(task.entity_type.as_str())
        .bind(&task.entity_id)
        .bind(task.outcome.as_str())
        .bind(&task.actor_id)
        .bind(task.reason.as_deref())
        .bind(task.state.as_str())
        .bind(i64::from(task.retry_count))
        .bind(i64::from(task.max_retries))
        .bind(encode_timestamp(task.available_at))
        .bind(task.claimed_by.as_deref())
        .bind(encode_optional_timestamp(task.claimed_at))
        .bind(task.last_error.as_deref())
        .bind(encode_timestamp(task.created_at))
        .bind(encode_timestamp(task.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Selects due candidates, then claims each one with a guarded update so that
    /// a task already moved by another worker is skipped rather than claimed twice.
    async fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DispatchTask>, RepositoryError> {
        let now_text = encode_timestamp(now);
        let stale_text = encode_timestamp(stale_before);
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM completion_dispatch_queue
             WHERE (state = 'queued' AND created_at <= ?)
                OR (state = 'retryable_failed' AND available_at <= ?)
                OR (state = 'running' AND claimed_at <= ?)
             ORDER BY available_at ASC, created_at ASC
             LIMIT ?"
        );
        let candidates = sqlx::query(&sql)
            .bind(&stale_text)
            .bind(&now_text)
            .bind(&stale_text)
            .bind(i64::from(limit))
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(task_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let candidate_count = candidates.len();
        let mut claimed = Vec::with_capacity(candidate_count);
        for mut task in candidates {
            let updated = sqlx::query(
                "UPDATE completion_dispatch_queue SET
                    state = 'running',
                    claimed_by = ?,
                    claimed_at = ?,
                    updated_at = ?
                 WHERE id = ? AND state = ? AND updated_at = ?",
            )
            .bind(worker_id)
            .bind(&now_text)
            .bind(&now_text)
            .bind(&task.id.0)
            .bind(task.state.as_str())
            .bind(encode_timestamp(task.updated_at))
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() == 1 {
                task.state = DispatchTaskState::Running;
                task.claimed_by = Some(worker_id.to_string());
                task.claimed_at = Some(now);
                task.updated_at = now;
                claimed.push(task);
            }
        }

        tx.commit().await?;
        if claimed.len() < candidate_count {
            debug!(
                event_name = "dispatch.queue.claim_contended",
                worker_id,
                candidates = candidate_count,
                claimed = claimed.len(),
                "some due tasks were claimed by another worker"
            );
        }
        Ok(claimed)
    }

    async fn list(
        &self,
        state: Option<DispatchTaskState>,
    ) -> Result<Vec<DispatchTask>, RepositoryError> {
        let rows = if let Some(state) = state {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM completion_dispatch_queue
                 WHERE state = ?
                 ORDER BY created_at ASC, id ASC"
            );
            sqlx::query(&sql).bind(state.as_str()).fetch_all(&self.pool).await?
        } else {
            let sql = format!(
                "SELECT {TASK_COLUMNS} FROM completion_dispatch_queue
                 ORDER BY created_at ASC, id ASC"
            );
            sqlx::query(&sql).fetch_all(&self.pool).await?
        };

        rows.into_iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl DispatchQueue for SqlDispatchQueueRepository {
    async fn find_task(&self, id: &DispatchTaskId) -> Result<Option<DispatchTask>, StoreError> {
        Ok(self.find(id).await?)
    }

    async fn save_task(&self, task: &DispatchTask) -> Result<(), StoreError> {
        Ok(self.upsert(task).await?)
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DispatchTask>, StoreError> {
        Ok(self.claim(worker_id, now, stale_before, limit).await?)
    }

    async fn list_tasks(
        &self,
        state: Option<DispatchTaskState>,
    ) -> Result<Vec<DispatchTask>, StoreError> {
        Ok(self.list(state).await?)
    }
}

/// Outbox insert used inside the decision transaction.
pub(crate) async fn insert_task(
    conn: &mut SqliteConnection,
    task: &DispatchTask,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO completion_dispatch_queue (
            id,
            request_id,
            entity_type,
            entity_id,
            outcome,
            actor_id,
            reason,
            state,
            retry_count,
            max_retries,
            available_at,
            claimed_by,
            claimed_at,
            last_error,
            created_at,
            updated_at
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.id.0)
    .bind(&task.request_id.0)
    .bind(task.entity_type.as_str())
    .bind(&task.entity_id)
    .bind(task.outcome.as_str())
    .bind(&task.actor_id)
    .bind(task.reason.as_deref())
    .bind(task.state.as_str())
    .bind(i64::from(task.retry_count))
    .bind(i64::from(task.max_retries))
    .bind(encode_timestamp(task.available_at))
    .bind(task.claimed_by.as_deref())
    .bind(encode_optional_timestamp(task.claimed_at))
    .bind(task.last_error.as_deref())
    .bind(encode_timestamp(task.created_at))
    .bind(encode_timestamp(task.updated_at))
    .execute(conn)
    .await?;

    Ok(())
}

fn task_from_row(row: SqliteRow) -> Result<DispatchTask, RepositoryError> {
    Ok(DispatchTask {
        id: DispatchTaskId(row.try_get("id")?),
        request_id: ApprovalRequestId(row.try_get("request_id")?),
        entity_type: parse_enum("entity type", row.try_get("entity_type")?, EntityType::parse)?,
        entity_id: row.try_get("entity_id")?,
        outcome: parse_enum("outcome", row.try_get("outcome")?, CompletionOutcome::parse)?,
        actor_id: row.try_get("actor_id")?,
        reason: row.try_get("reason")?,
        state: parse_enum("dispatch task state", row.try_get("state")?, DispatchTaskState::parse)?,
        retry_count: parse_u32("retry_count", row.try_get("retry_count")?)?,
        max_retries: parse_u32("max_retries", row.try_get("max_retries")?)?,
        available_at: parse_timestamp("available_at", row.try_get("available_at")?)?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: parse_optional_timestamp("claimed_at", row.try_get("claimed_at")?)?,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
