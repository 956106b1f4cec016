use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalRequestId(pub String);

impl fmt::Display for ApprovalRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Domain kinds whose high-value actions are routed through approval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Journal,
    Payment,
    Invoice,
    Expense,
    Voucher,
    DepartmentBudget,
}

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        Self::Journal,
        Self::Payment,
        Self::Invoice,
        Self::Expense,
        Self::Voucher,
        Self::DepartmentBudget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Journal => "journal",
            Self::Payment => "payment",
            Self::Invoice => "invoice",
            Self::Expense => "expense",
            Self::Voucher => "voucher",
            Self::DepartmentBudget => "department_budget",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "journal" | "journal_entry" => Some(Self::Journal),
            "payment" => Some(Self::Payment),
            "invoice" => Some(Self::Invoice),
            "expense" => Some(Self::Expense),
            "voucher" => Some(Self::Voucher),
            "department_budget" | "budget" => Some(Self::DepartmentBudget),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelStatus {
    Pending,
    Approved,
    Rejected,
    /// Reserved for partial-approval policies; never produced by the lifecycle.
    Skipped,
}

impl LevelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_cleared(&self) -> bool {
        matches!(self, Self::Approved | Self::Skipped)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Sort key where the most urgent priority comes first.
    pub fn urgency_rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

/// One tier of required sign-off within a request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub level: u32,
    pub approver_role: String,
    /// Specific identities allowed to act; empty means any holder of the role.
    pub approver_ids: Vec<String>,
    pub amount_threshold: Decimal,
    pub status: LevelStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub comments: Option<String>,
}

impl ApprovalLevel {
    pub fn pending(
        level: u32,
        approver_role: impl Into<String>,
        amount_threshold: Decimal,
    ) -> Self {
        Self {
            level,
            approver_role: approver_role.into(),
            approver_ids: Vec::new(),
            amount_threshold,
            status: LevelStatus::Pending,
            approved_by: None,
            approved_at: None,
            comments: None,
        }
    }

    pub fn permits(&self, actor: &Actor) -> bool {
        if normalize_role(&self.approver_role) != normalize_role(&actor.role) {
            return false;
        }

        self.approver_ids.is_empty() || self.approver_ids.iter().any(|id| id == &actor.id)
    }
}

/// The identity acting on a request, as resolved by the calling feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self { id: id.into(), role: role.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalRequestId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub description: Option<String>,
    pub amount: Decimal,
    pub metadata: serde_json::Value,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub current_level: u32,
    pub total_levels: u32,
    pub levels: Vec<ApprovalLevel>,
    pub status: RequestStatus,
    pub priority: Priority,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every committed decision; used for optimistic conflict detection.
    pub state_version: u32,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn active_level(&self) -> Option<&ApprovalLevel> {
        self.levels.iter().find(|level| level.level == self.current_level)
    }

    pub fn active_level_mut(&mut self) -> Option<&mut ApprovalLevel> {
        let current = self.current_level;
        self.levels.iter_mut().find(|level| level.level == current)
    }

    pub fn all_levels_cleared(&self) -> bool {
        self.levels.iter().all(|level| level.status.is_cleared())
    }
}

pub fn normalize_role(role: &str) -> String {
    role.trim().to_ascii_lowercase()
}
