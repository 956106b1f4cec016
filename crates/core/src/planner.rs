use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::ThresholdCatalog;
use crate::domain::approval::{ApprovalLevel, EntityType, Priority};
use crate::errors::WorkflowError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityThresholds {
    pub high_above: Decimal,
    pub medium_above: Decimal,
}

impl Default for PriorityThresholds {
    fn default() -> Self {
        Self { high_above: Decimal::new(200_000, 0), medium_above: Decimal::new(50_000, 0) }
    }
}

impl PriorityThresholds {
    pub fn classify(&self, amount: Decimal) -> Priority {
        if amount > self.high_above {
            Priority::High
        } else if amount > self.medium_above {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LevelPlan {
    pub levels: Vec<ApprovalLevel>,
    pub priority: Priority,
}

#[derive(Clone, Debug, Default)]
pub struct LevelPlanner {
    priority: PriorityThresholds,
}

impl LevelPlanner {
    pub fn new(priority: PriorityThresholds) -> Self {
        Self { priority }
    }

    pub fn priority_thresholds(&self) -> PriorityThresholds {
        self.priority
    }

    /// Selects the levels a request for `amount` must pass through.
    ///
    /// Level 1 is always included; any other level is included when
    /// `amount >= amount_threshold`. Levels come back sorted ascending, all pending.
    pub fn plan_levels(
        &self,
        catalog: &ThresholdCatalog,
        entity_type: EntityType,
        amount: Decimal,
    ) -> Result<LevelPlan, WorkflowError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(WorkflowError::Validation(format!(
                "amount must not be negative, got {amount}"
            )));
        }

        let entry = catalog
            .active_entry(entity_type)
            .ok_or(WorkflowError::ConfigurationMissing { entity_type })?;

        let mut levels: Vec<ApprovalLevel> = entry
            .levels
            .iter()
            .filter(|level| level.level == 1 || amount >= level.amount_threshold)
            .map(|level| {
                ApprovalLevel::pending(
                    level.level,
                    level.approver_role.clone(),
                    level.amount_threshold,
                )
            })
            .collect();
        levels.sort_by_key(|level| level.level);

        Ok(LevelPlan { levels, priority: self.priority.classify(amount) })
    }
}

/// Shared creation-path predicate: does an action of `amount` need sign-off?
pub fn requires_approval(amount: Decimal, threshold: Decimal) -> bool {
    amount >= threshold
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{requires_approval, LevelPlanner, PriorityThresholds};
    use crate::catalog::{CatalogEntry, ThresholdCatalog, ThresholdLevel};
    use crate::domain::approval::{EntityType, LevelStatus, Priority};
    use crate::errors::WorkflowError;

    fn three_tier_catalog() -> ThresholdCatalog {
        ThresholdCatalog::new(vec![CatalogEntry {
            entity_type: EntityType::Invoice,
            is_active: true,
            levels: vec![
                ThresholdLevel::new(1, "Manager", Decimal::new(50_000, 0)),
                ThresholdLevel::new(2, "Finance Manager", Decimal::new(200_000, 0)),
                ThresholdLevel::new(3, "CFO", Decimal::new(1_000_000, 0)),
            ],
        }])
        .expect("valid catalog")
    }

    fn planned_levels(amount: i64) -> Vec<u32> {
        LevelPlanner::default()
            .plan_levels(&three_tier_catalog(), EntityType::Invoice, Decimal::new(amount, 0))
            .expect("plan")
            .levels
            .iter()
            .map(|level| level.level)
            .collect()
    }

    #[test]
    fn single_level_plan_for_small_amount() {
        let catalog = ThresholdCatalog::new(vec![CatalogEntry {
            entity_type: EntityType::Payment,
            is_active: true,
            levels: vec![ThresholdLevel::new(1, "Manager", Decimal::new(50_000, 0))],
        }])
        .expect("valid catalog");

        let plan = LevelPlanner::default()
            .plan_levels(&catalog, EntityType::Payment, Decimal::new(10_000, 0))
            .expect("plan");

        assert_eq!(plan.levels.len(), 1);
        assert_eq!(plan.levels[0].level, 1);
        assert_eq!(plan.levels[0].approver_role, "Manager");
        assert_eq!(plan.levels[0].status, LevelStatus::Pending);
        assert!(plan.levels[0].approver_ids.is_empty());
        assert_eq!(plan.priority, Priority::Low);
    }

    #[test]
    fn level_one_is_included_below_its_threshold() {
        assert_eq!(planned_levels(0), vec![1]);
        assert_eq!(planned_levels(49_999), vec![1]);
    }

    #[test]
    fn levels_are_included_when_amount_reaches_threshold() {
        assert_eq!(planned_levels(200_000), vec![1, 2]);
        assert_eq!(planned_levels(500_000), vec![1, 2]);
        assert_eq!(planned_levels(1_000_000), vec![1, 2, 3]);
    }

    #[test]
    fn plan_inclusion_matches_thresholds_across_amounts() {
        let catalog = three_tier_catalog();
        let entry = catalog.entry(EntityType::Invoice).expect("entry");

        for amount in [0_i64, 1, 50_000, 199_999, 200_000, 999_999, 1_000_000, 5_000_000] {
            let amount = Decimal::new(amount, 0);
            let expected: Vec<u32> = entry
                .levels
                .iter()
                .filter(|level| level.level == 1 || amount >= level.amount_threshold)
                .map(|level| level.level)
                .collect();
            let plan = LevelPlanner::default()
                .plan_levels(&catalog, EntityType::Invoice, amount)
                .expect("plan");
            let actual: Vec<u32> = plan.levels.iter().map(|level| level.level).collect();

            assert_eq!(actual, expected, "amount {amount}");
            assert!(actual.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn three_level_plan_is_high_priority() {
        let plan = LevelPlanner::default()
            .plan_levels(&three_tier_catalog(), EntityType::Invoice, Decimal::new(1_500_000, 0))
            .expect("plan");

        assert_eq!(plan.levels.len(), 3);
        assert_eq!(plan.priority, Priority::High);
    }

    #[test]
    fn priority_boundaries_are_strict() {
        let thresholds = PriorityThresholds::default();

        assert_eq!(thresholds.classify(Decimal::new(50_000, 0)), Priority::Low);
        assert_eq!(thresholds.classify(Decimal::new(50_001, 0)), Priority::Medium);
        assert_eq!(thresholds.classify(Decimal::new(200_000, 0)), Priority::Medium);
        assert_eq!(thresholds.classify(Decimal::new(200_001, 0)), Priority::High);
    }

    #[test]
    fn missing_or_inactive_entry_is_configuration_missing() {
        let mut catalog_entries = vec![CatalogEntry {
            entity_type: EntityType::Voucher,
            is_active: false,
            levels: vec![ThresholdLevel::new(1, "Manager", Decimal::ZERO)],
        }];
        catalog_entries.extend(three_tier_catalog().entries().cloned());
        let catalog = ThresholdCatalog::new(catalog_entries).expect("valid catalog");
        let planner = LevelPlanner::default();

        assert_eq!(
            planner.plan_levels(&catalog, EntityType::Voucher, Decimal::ONE),
            Err(WorkflowError::ConfigurationMissing { entity_type: EntityType::Voucher })
        );
        assert_eq!(
            planner.plan_levels(&catalog, EntityType::Expense, Decimal::ONE),
            Err(WorkflowError::ConfigurationMissing { entity_type: EntityType::Expense })
        );
    }

    #[test]
    fn negative_amounts_are_rejected() {
        let result = LevelPlanner::default().plan_levels(
            &three_tier_catalog(),
            EntityType::Invoice,
            Decimal::new(-5, 0),
        );

        assert!(matches!(result, Err(WorkflowError::Validation(_))));
    }

    #[test]
    fn requires_approval_is_inclusive_of_threshold() {
        let threshold = Decimal::new(100_000, 0);

        assert!(requires_approval(Decimal::new(100_000, 0), threshold));
        assert!(!requires_approval(Decimal::new(99_999, 0), threshold));
    }
}
