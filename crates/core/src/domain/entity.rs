use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalRequestId, EntityType};

/// Workflow-relevant status of an invoice, payment, journal entry or other protected record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Draft,
    PendingApproval,
    Approved,
    Posted,
    Rejected,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Posted => "posted",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Some(Self::Draft),
            "pending_approval" => Some(Self::PendingApproval),
            "approved" => Some(Self::Approved),
            "posted" => Some(Self::Posted),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// The slice of a domain record that the approval subsystem reads and mutates.
///
/// The owning feature keeps everything else about the record; this subsystem only
/// holds a weak back-reference from the entity to its latest approval request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedEntity {
    pub entity_type: EntityType,
    pub id: String,
    pub amount: Decimal,
    pub status: EntityStatus,
    pub approval_request_id: Option<ApprovalRequestId>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    /// Only meaningful for journal entries.
    pub is_posted: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProtectedEntity {
    pub fn draft(entity_type: EntityType, id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            entity_type,
            id: id.into(),
            amount,
            status: EntityStatus::Draft,
            approval_request_id: None,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            is_posted: false,
            updated_at: Utc::now(),
        }
    }
}
