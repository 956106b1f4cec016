//! Threshold catalog: per-entity-type approval tiers selected by amount.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::approval::EntityType;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdLevel {
    pub level: u32,
    pub approver_role: String,
    pub amount_threshold: Decimal,
}

impl ThresholdLevel {
    pub fn new(level: u32, approver_role: impl Into<String>, amount_threshold: Decimal) -> Self {
        Self { level, approver_role: approver_role.into(), amount_threshold }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub entity_type: EntityType,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub levels: Vec<ThresholdLevel>,
}

fn default_active() -> bool {
    true
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate catalog entry for `{0}`")]
    DuplicateEntityType(EntityType),
    #[error("catalog entry `{0}` has no levels")]
    EmptyLevels(EntityType),
    #[error(
        "catalog entry `{entity_type}` must number its levels 1..={expected_max}, \
         found {found:?}"
    )]
    NonContiguousLevels { entity_type: EntityType, expected_max: u32, found: Vec<u32> },
    #[error("catalog entry `{entity_type}` level {level} has a blank approver role")]
    BlankRole { entity_type: EntityType, level: u32 },
    #[error("catalog entry `{entity_type}` level {level} threshold is below level {previous}")]
    DecreasingThreshold { entity_type: EntityType, level: u32, previous: u32 },
    #[error("catalog entry `{entity_type}` level {level} has a negative threshold")]
    NegativeThreshold { entity_type: EntityType, level: u32 },
    #[error("could not parse catalog document: {0}")]
    Parse(String),
}

/// Read-only snapshot of approval tiers keyed by entity type.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThresholdCatalog {
    entries: BTreeMap<EntityType, CatalogEntry>,
}

impl ThresholdCatalog {
    /// Builds a catalog, sorting each entry's levels and rejecting shapes that
    /// would produce gaps in a planned request (levels must be `1..=n` and
    /// thresholds non-decreasing from level 2 upward).
    pub fn new(entries: Vec<CatalogEntry>) -> Result<Self, CatalogError> {
        let mut by_type = BTreeMap::new();

        for mut entry in entries {
            entry.levels.sort_by_key(|level| level.level);
            validate_entry(&entry)?;
            let entity_type = entry.entity_type;
            if by_type.insert(entity_type, entry).is_some() {
                return Err(CatalogError::DuplicateEntityType(entity_type));
            }
        }

        Ok(Self { entries: by_type })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, CatalogError> {
        let document: CatalogDocument =
            toml::from_str(raw).map_err(|error| CatalogError::Parse(error.to_string()))?;
        Self::new(document.entry)
    }

    pub fn to_toml_string(&self) -> Result<String, CatalogError> {
        let document = CatalogDocument { entry: self.entries.values().cloned().collect() };
        toml::to_string_pretty(&document).map_err(|error| CatalogError::Parse(error.to_string()))
    }

    pub fn entry(&self, entity_type: EntityType) -> Option<&CatalogEntry> {
        self.entries.get(&entity_type)
    }

    pub fn active_entry(&self, entity_type: EntityType) -> Option<&CatalogEntry> {
        self.entry(entity_type).filter(|entry| entry.is_active)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Default tiers: manager, finance manager, CFO for ledger documents; manager,
    /// director, CFO for department budgets.
    pub fn default_catalog() -> Self {
        let ledger_levels = || {
            vec![
                ThresholdLevel::new(1, "Manager", Decimal::new(50_000, 0)),
                ThresholdLevel::new(2, "Finance Manager", Decimal::new(200_000, 0)),
                ThresholdLevel::new(3, "CFO", Decimal::new(1_000_000, 0)),
            ]
        };

        let mut entries: Vec<CatalogEntry> = [
            EntityType::Journal,
            EntityType::Payment,
            EntityType::Invoice,
            EntityType::Expense,
            EntityType::Voucher,
        ]
        .into_iter()
        .map(|entity_type| CatalogEntry { entity_type, levels: ledger_levels(), is_active: true })
        .collect();

        entries.push(CatalogEntry {
            entity_type: EntityType::DepartmentBudget,
            levels: vec![
                ThresholdLevel::new(1, "Manager", Decimal::new(100_000, 0)),
                ThresholdLevel::new(2, "Director", Decimal::new(500_000, 0)),
                ThresholdLevel::new(3, "CFO", Decimal::new(1_000_000, 0)),
            ],
            is_active: true,
        });

        Self::new(entries).unwrap_or_default()
    }
}

fn validate_entry(entry: &CatalogEntry) -> Result<(), CatalogError> {
    let entity_type = entry.entity_type;
    if entry.levels.is_empty() {
        return Err(CatalogError::EmptyLevels(entity_type));
    }

    let found: Vec<u32> = entry.levels.iter().map(|level| level.level).collect();
    let contiguous = found.iter().enumerate().all(|(index, level)| *level as usize == index + 1);
    if !contiguous {
        return Err(CatalogError::NonContiguousLevels {
            entity_type,
            expected_max: entry.levels.len() as u32,
            found,
        });
    }

    for level in &entry.levels {
        if level.approver_role.trim().is_empty() {
            return Err(CatalogError::BlankRole { entity_type, level: level.level });
        }
        if level.amount_threshold.is_sign_negative() {
            return Err(CatalogError::NegativeThreshold { entity_type, level: level.level });
        }
    }

    // Level 1 is always included, so only levels 2.. must be ordered for the
    // amount filter to select a prefix.
    for pair in entry.levels.windows(2).skip(1) {
        if pair[1].amount_threshold < pair[0].amount_threshold {
            return Err(CatalogError::DecreasingThreshold {
                entity_type,
                level: pair[1].level,
                previous: pair[0].level,
            });
        }
    }

    Ok(())
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    entry: Vec<CatalogEntry>,
}
