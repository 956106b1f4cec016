//! Pure state machine over a single approval request.
//!
//! Every function here validates and mutates an in-memory request; persisting the
//! result atomically is the job of [`crate::service::ApprovalWorkflow`].

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::approval::{
    Actor, ApprovalLevel, ApprovalRequest, ApprovalRequestId, EntityType, LevelStatus,
    RequestStatus,
};
use crate::errors::WorkflowError;
use crate::planner::LevelPlan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewApprovalRequest {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub title: String,
    pub amount: rust_decimal::Decimal,
    pub requested_by: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// What a committed decision did to the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The active level was approved and the next level is now active.
    Advanced { from_level: u32, to_level: u32 },
    /// The request reached a terminal status at `level`.
    Completed { level: u32, status: RequestStatus },
}

impl Transition {
    pub fn terminal_status(&self) -> Option<RequestStatus> {
        match self {
            Self::Advanced { .. } => None,
            Self::Completed { status, .. } => Some(*status),
        }
    }
}

pub fn open_request(
    input: NewApprovalRequest,
    plan: LevelPlan,
    now: DateTime<Utc>,
) -> Result<ApprovalRequest, WorkflowError> {
    if input.title.trim().is_empty() {
        return Err(WorkflowError::Validation("title is required".to_owned()));
    }
    if input.entity_id.trim().is_empty() {
        return Err(WorkflowError::Validation("entity id is required".to_owned()));
    }
    if input.requested_by.trim().is_empty() {
        return Err(WorkflowError::Validation("requester is required".to_owned()));
    }
    if plan.levels.first().map(|level| level.level) != Some(1) {
        return Err(WorkflowError::Validation("plan must start at level 1".to_owned()));
    }

    let total_levels = plan.levels.len() as u32;
    Ok(ApprovalRequest {
        id: ApprovalRequestId(format!("APR-{}", Uuid::new_v4())),
        entity_type: input.entity_type,
        entity_id: input.entity_id,
        title: input.title,
        description: input.description,
        amount: input.amount,
        metadata: input.metadata.unwrap_or(serde_json::Value::Null),
        requested_by: input.requested_by,
        requested_at: now,
        current_level: 1,
        total_levels,
        levels: plan.levels,
        status: RequestStatus::Pending,
        priority: plan.priority,
        completed_at: None,
        state_version: 1,
        updated_at: now,
    })
}

pub fn approve(
    request: &mut ApprovalRequest,
    actor: &Actor,
    comments: Option<String>,
    now: DateTime<Utc>,
) -> Result<Transition, WorkflowError> {
    let level = authorize_active_level(request, actor)?;
    level.status = LevelStatus::Approved;
    level.approved_by = Some(actor.id.clone());
    level.approved_at = Some(now);
    level.comments = comments.filter(|text| !text.trim().is_empty());
    let from_level = level.level;

    if request.all_levels_cleared() {
        request.status = RequestStatus::Approved;
        request.completed_at = Some(now);
        return Ok(Transition::Completed { level: from_level, status: RequestStatus::Approved });
    }

    request.current_level += 1;
    Ok(Transition::Advanced { from_level, to_level: request.current_level })
}

/// A single veto at any level terminates the whole request.
pub fn reject(
    request: &mut ApprovalRequest,
    actor: &Actor,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Transition, WorkflowError> {
    let reason = required_reason(reason, "rejection")?;
    let level = authorize_active_level(request, actor)?;
    level.status = LevelStatus::Rejected;
    level.approved_by = Some(actor.id.clone());
    level.approved_at = Some(now);
    level.comments = Some(reason);
    let at_level = level.level;

    request.status = RequestStatus::Rejected;
    request.completed_at = Some(now);
    Ok(Transition::Completed { level: at_level, status: RequestStatus::Rejected })
}

/// Operator-issued out-of-band termination. Levels are left untouched.
pub fn cancel(
    request: &mut ApprovalRequest,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Transition, WorkflowError> {
    required_reason(reason, "cancellation")?;
    ensure_pending(request)?;

    request.status = RequestStatus::Cancelled;
    request.completed_at = Some(now);
    Ok(Transition::Completed { level: request.current_level, status: RequestStatus::Cancelled })
}

pub fn ensure_pending(request: &ApprovalRequest) -> Result<(), WorkflowError> {
    if request.status.is_terminal() {
        return Err(WorkflowError::AlreadyProcessed {
            id: request.id.clone(),
            status: request.status,
        });
    }
    Ok(())
}

/// Checks the level-progression invariant and returns the active level.
pub fn active_level(request: &ApprovalRequest) -> Result<&ApprovalLevel, WorkflowError> {
    ensure_pending(request)?;
    check_progression(request)?;
    request.active_level().ok_or_else(|| invalid_state(request, "active level missing"))
}

fn authorize_active_level<'a>(
    request: &'a mut ApprovalRequest,
    actor: &Actor,
) -> Result<&'a mut ApprovalLevel, WorkflowError> {
    let level = active_level(request)?;
    if !level.permits(actor) {
        return Err(WorkflowError::Unauthorized {
            actor_id: actor.id.clone(),
            actor_role: actor.role.clone(),
            level: level.level,
            required_role: level.approver_role.clone(),
        });
    }

    let id = request.id.clone();
    request
        .active_level_mut()
        .ok_or_else(|| WorkflowError::InvalidState { id, detail: "active level missing".into() })
}

fn check_progression(request: &ApprovalRequest) -> Result<(), WorkflowError> {
    let current = request.current_level;
    if current == 0 || current > request.total_levels {
        return Err(invalid_state(
            request,
            &format!("current level {current} outside 1..={}", request.total_levels),
        ));
    }

    for level in &request.levels {
        let consistent = match level.level.cmp(&current) {
            std::cmp::Ordering::Less => level.status.is_cleared(),
            std::cmp::Ordering::Equal => level.status == LevelStatus::Pending,
            std::cmp::Ordering::Greater => level.status == LevelStatus::Pending,
        };
        if !consistent {
            return Err(invalid_state(
                request,
                &format!(
                    "level {} is {} while level {current} is active",
                    level.level,
                    level.status.as_str()
                ),
            ));
        }
    }

    Ok(())
}

fn required_reason(reason: &str, action: &str) -> Result<String, WorkflowError> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::Validation(format!("a {action} reason is required")));
    }
    Ok(trimmed.to_owned())
}

fn invalid_state(request: &ApprovalRequest, detail: &str) -> WorkflowError {
    WorkflowError::InvalidState { id: request.id.clone(), detail: detail.to_owned() }
}
