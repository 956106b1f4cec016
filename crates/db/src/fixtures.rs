use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Row;

use tollgate_core::catalog::ThresholdCatalog;
use tollgate_core::domain::approval::EntityType;
use tollgate_core::domain::entity::ProtectedEntity;
use tollgate_core::notify::Contact;

use crate::connection::DbPool;
use crate::repositories::{
    RepositoryError, SqlCatalogRepository, SqlContactDirectory, SqlEntityRepository,
};

/// Approvers and requesters used by the demo dataset.
const SEED_CONTACTS: &[(&str, &str, &str)] = &[
    ("u-clerk", "Dana Clerk", "dana.clerk@tollgate.local"),
    ("u-manager", "Morgan Manager", "morgan.manager@tollgate.local"),
    ("u-finance", "Frankie Finance", "frankie.finance@tollgate.local"),
    ("u-director", "Dev Director", "dev.director@tollgate.local"),
    ("u-cfo", "Casey CFO", "casey.cfo@tollgate.local"),
];

/// Draft records ready to be submitted: one per tier of the default catalog.
const SEED_ENTITIES: &[(EntityType, &str, i64)] = &[
    (EntityType::Expense, "EXP-001", 12_500),
    (EntityType::Invoice, "INV-001", 75_000),
    (EntityType::Payment, "PAY-001", 250_000),
    (EntityType::Journal, "JE-001", 1_200_000),
    (EntityType::DepartmentBudget, "BUD-001", 600_000),
];

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SeedResult {
    pub catalog_levels: usize,
    pub contacts: usize,
    pub entities: usize,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct VerificationResult {
    pub all_passed: bool,
    pub checks: Vec<VerificationCheck>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct VerificationCheck {
    pub name: &'static str,
    pub expected: i64,
    pub actual: i64,
    pub passed: bool,
}

/// Deterministic catalog, contacts and draft entities for local runs.
pub struct DemoSeedDataset;

impl DemoSeedDataset {
    pub async fn load(
        pool: &DbPool,
        catalog: &ThresholdCatalog,
    ) -> Result<SeedResult, RepositoryError> {
        let catalog_levels = SqlCatalogRepository::new(pool.clone()).replace(catalog).await?;

        let contacts = SqlContactDirectory::new(pool.clone());
        for (user_id, display_name, email) in SEED_CONTACTS {
            contacts
                .save_contact(&Contact {
                    user_id: (*user_id).to_string(),
                    display_name: (*display_name).to_string(),
                    email: Some((*email).to_string()),
                })
                .await?;
        }

        let entities = SqlEntityRepository::new(pool.clone());
        let now = Utc::now();
        for (entity_type, id, amount) in SEED_ENTITIES {
            let mut entity = ProtectedEntity::draft(*entity_type, *id, Decimal::new(*amount, 0));
            entity.updated_at = now;
            entities.upsert(&entity).await?;
        }

        Ok(SeedResult {
            catalog_levels,
            contacts: SEED_CONTACTS.len(),
            entities: SEED_ENTITIES.len(),
        })
    }

    /// Checks that `catalog` and the demo records are present.
    pub async fn verify(
        pool: &DbPool,
        catalog: &ThresholdCatalog,
    ) -> Result<VerificationResult, RepositoryError> {
        let mut checks = Vec::new();

        let catalog_types: i64 =
            sqlx::query("SELECT COUNT(DISTINCT entity_type) AS count FROM threshold_catalog")
                .fetch_one(pool)
                .await?
                .try_get("count")?;
        checks.push(check("catalog_entity_types", catalog.len() as i64, catalog_types));

        let contacts: i64 = sqlx::query("SELECT COUNT(*) AS count FROM approver_contact")
            .fetch_one(pool)
            .await?
            .try_get("count")?;
        checks.push(check("contacts", SEED_CONTACTS.len() as i64, contacts));

        let mut seeded_entities = 0_i64;
        for (entity_type, id, _) in SEED_ENTITIES {
            let found: i64 = sqlx::query(
                "SELECT COUNT(*) AS count FROM protected_entity WHERE entity_type = ? AND id = ?",
            )
            .bind(entity_type.as_str())
            .bind(*id)
            .fetch_one(pool)
            .await?
            .try_get("count")?;
            seeded_entities += found;
        }
        checks.push(check("entities", SEED_ENTITIES.len() as i64, seeded_entities));

        let all_passed = checks.iter().all(|check| check.passed);
        Ok(VerificationResult { all_passed, checks })
    }
}

fn check(name: &'static str, expected: i64, actual: i64) -> VerificationCheck {
    VerificationCheck { name, expected, actual, passed: expected == actual }
}

#[cfg(test)]
mod tests {
    use tollgate_core::catalog::ThresholdCatalog;

    use super::DemoSeedDataset;
    use crate::repositories::test_support::setup_pool;

    #[tokio::test]
    async fn seed_then_verify_passes_and_is_repeatable() {
        let pool = setup_pool().await;
        let catalog = ThresholdCatalog::default_catalog();

        let first = DemoSeedDataset::load(&pool, &catalog).await.expect("seed");
        let second = DemoSeedDataset::load(&pool, &catalog).await.expect("re-seed");
        assert_eq!(first, second);

        let verification = DemoSeedDataset::verify(&pool, &catalog).await.expect("verify");
        assert!(verification.all_passed, "{:?}", verification.checks);
        pool.close().await;
    }

    #[tokio::test]
    async fn verify_reports_missing_data() {
        let pool = setup_pool().await;

        let verification = DemoSeedDataset::verify(&pool, &ThresholdCatalog::default_catalog())
            .await
            .expect("verify");

        assert!(!verification.all_passed);
        assert!(verification.checks.iter().all(|check| check.actual == 0));
        pool.close().await;
    }
}
