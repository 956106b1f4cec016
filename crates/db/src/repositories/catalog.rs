use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use tollgate_core::catalog::{CatalogEntry, ThresholdCatalog, ThresholdLevel};
use tollgate_core::domain::approval::EntityType;
use tollgate_core::ports::{CatalogSource, StoreError};

use super::{encode_timestamp, parse_decimal, parse_enum, parse_u32, RepositoryError};
use crate::DbPool;

/// Persisted threshold catalog; each row is one level of one entity type.
pub struct SqlCatalogRepository {
    pool: DbPool,
}

impl SqlCatalogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load(&self) -> Result<ThresholdCatalog, RepositoryError> {
        let rows = sqlx::query(
            "SELECT entity_type, level, approver_role, amount_threshold, is_active
             FROM threshold_catalog
             ORDER BY entity_type ASC, level ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut entries: BTreeMap<EntityType, CatalogEntry> = BTreeMap::new();
        for row in rows {
            let entity_type =
                parse_enum("entity type", row.try_get("entity_type")?, EntityType::parse)?;
            let is_active: bool = row.try_get("is_active")?;
            let level = ThresholdLevel {
                level: parse_u32("level", row.try_get("level")?)?,
                approver_role: row.try_get("approver_role")?,
                amount_threshold: parse_decimal(
                    "amount_threshold",
                    row.try_get("amount_threshold")?,
                )?,
            };

            let entry = entries.entry(entity_type).or_insert_with(|| CatalogEntry {
                entity_type,
                is_active: true,
                levels: Vec::new(),
            });
            entry.is_active &= is_active;
            entry.levels.push(level);
        }

        ThresholdCatalog::new(entries.into_values().collect())
            .map_err(|error| RepositoryError::Decode(format!("stored catalog is invalid: {error}")))
    }

    /// Replaces the stored catalog in one transaction.
    pub async fn replace(&self, catalog: &ThresholdCatalog) -> Result<usize, RepositoryError> {
        let updated_at = encode_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM threshold_catalog").execute(&mut *tx).await?;

        let mut written = 0;
        for entry in catalog.entries() {
            for level in &entry.levels {
                sqlx::query(
                    "INSERT INTO threshold_catalog (
                        entity_type,
                        level,
                        approver_role,
                        amount_threshold,
                        is_active,
                        updated_at
                     ) VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(entry.entity_type.as_str())
                .bind(i64::from(level.level))
                .bind(&level.approver_role)
                .bind(level.amount_threshold.to_string())
                .bind(entry.is_active)
                .bind(&updated_at)
                .execute(&mut *tx)
                .await?;
                written += 1;
            }
        }

        tx.commit().await?;
        Ok(written)
    }
}

#[async_trait]
impl CatalogSource for SqlCatalogRepository {
    async fn load_catalog(&self) -> Result<ThresholdCatalog, StoreError> {
        Ok(self.load().await?)
    }
}
