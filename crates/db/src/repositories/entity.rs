use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use tollgate_core::domain::approval::{ApprovalRequestId, EntityType};
use tollgate_core::domain::entity::{EntityStatus, ProtectedEntity};
use tollgate_core::ports::{EntityStore, StoreError};

use super::{
    encode_optional_timestamp, encode_timestamp, parse_decimal, parse_enum,
    parse_optional_timestamp, parse_timestamp, RepositoryError,
};
use crate::DbPool;

pub struct SqlEntityRepository {
    pool: DbPool,
}

impl SqlEntityRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn find(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ProtectedEntity>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                entity_type,
                id,
                amount,
                status,
                approval_request_id,
                approved_by,
                approved_at,
                rejection_reason,
                is_posted,
                updated_at
             FROM protected_entity
             WHERE entity_type = ? AND id = ?",
        )
        .bind(entity_type.as_str())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(entity_from_row).transpose()
    }

    pub(crate) async fn upsert(&self, entity: &ProtectedEntity) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO protected_entity (
                entity_type,
                id,
                amount,
                status,
                approval_request_id,
                approved_by,
                approved_at,
                rejection_reason,
                is_posted,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(entity_type, id) DO UPDATE SET
                amount = excluded.amount,
                status = excluded.status,
                approval_request_id = excluded.approval_request_id,
                approved_by = excluded.approved_by,
                approved_at = excluded.approved_at,
                rejection_reason = excluded.rejection_reason,
                is_posted = excluded.is_posted,
                updated_at = excluded.updated_at",
        )
        .bind(entity.entity_type.as_str())
        .bind(&entity.id)
        .bind(entity.amount.to_string())
        .bind(entity.status.as_str())
        .bind(entity.approval_request_id.as_ref().map(|id| id.0.as_str()))
        .bind(entity.approved_by.as_deref())
        .bind(encode_optional_timestamp(entity.approved_at))
        .bind(entity.rejection_reason.as_deref())
        .bind(entity.is_posted)
        .bind(encode_timestamp(entity.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EntityStore for SqlEntityRepository {
    async fn find_entity(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ProtectedEntity>, StoreError> {
        Ok(self.find(entity_type, id).await?)
    }

    async fn save_entity(&self, entity: &ProtectedEntity) -> Result<(), StoreError> {
        Ok(self.upsert(entity).await?)
    }
}

fn entity_from_row(row: SqliteRow) -> Result<ProtectedEntity, RepositoryError> {
    Ok(ProtectedEntity {
        entity_type: parse_enum("entity type", row.try_get("entity_type")?, EntityType::parse)?,
        id: row.try_get("id")?,
        amount: parse_decimal("amount", row.try_get("amount")?)?,
        status: parse_enum("entity status", row.try_get("status")?, EntityStatus::parse)?,
        approval_request_id: row
            .try_get::<Option<String>, _>("approval_request_id")?
            .map(ApprovalRequestId),
        approved_by: row.try_get("approved_by")?,
        approved_at: parse_optional_timestamp("approved_at", row.try_get("approved_at")?)?,
        rejection_reason: row.try_get("rejection_reason")?,
        is_posted: row.try_get("is_posted")?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
