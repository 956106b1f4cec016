//! Entity Completion Dispatcher and the outbox reconciler that retries it.
//!
//! A terminal decision is durable before any handler runs. Handlers only mutate the
//! originating entity, and they must be idempotent because the reconciler delivers
//! at least once.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::approval::{ApprovalRequest, ApprovalRequestId, EntityType};
use crate::domain::dispatch::{CompletionOutcome, DispatchTask, DispatchTaskId, DispatchTaskState};
use crate::domain::entity::{EntityStatus, ProtectedEntity};
use crate::ports::{DispatchQueue, EntityStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionCommand {
    pub request_id: ApprovalRequestId,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub outcome: CompletionOutcome,
    pub actor_id: String,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl From<&DispatchTask> for CompletionCommand {
    fn from(task: &DispatchTask) -> Self {
        Self {
            request_id: task.request_id.clone(),
            entity_type: task.entity_type,
            entity_id: task.entity_id.clone(),
            outcome: task.outcome,
            actor_id: task.actor_id.clone(),
            reason: task.reason.clone(),
            decided_at: task.created_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchReport {
    Applied,
    AlreadyApplied,
    EntityMissing,
    /// The entity now belongs to a different approval request.
    Superseded,
    UnknownEntityType,
}

#[async_trait]
pub trait CompletionHandler: Send + Sync {
    fn entity_type(&self) -> EntityType;

    async fn complete(&self, command: &CompletionCommand) -> Result<DispatchReport, StoreError>;
}

/// The status an entity of `entity_type` takes once approved.
pub fn approved_status(entity_type: EntityType) -> EntityStatus {
    match entity_type {
        EntityType::Journal => EntityStatus::Posted,
        EntityType::Payment
        | EntityType::Invoice
        | EntityType::Expense
        | EntityType::Voucher
        | EntityType::DepartmentBudget => EntityStatus::Approved,
    }
}

/// Handler for documents whose approved state is plain `approved`.
pub struct ApprovedStateHandler {
    entity_type: EntityType,
    entities: Arc<dyn EntityStore>,
}

impl ApprovedStateHandler {
    pub fn new(entity_type: EntityType, entities: Arc<dyn EntityStore>) -> Self {
        Self { entity_type, entities }
    }
}

#[async_trait]
impl CompletionHandler for ApprovedStateHandler {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    async fn complete(&self, command: &CompletionCommand) -> Result<DispatchReport, StoreError> {
        apply_to_stored_entity(self.entities.as_ref(), command, EntityStatus::Approved, false).await
    }
}

/// Journal entries are posted on approval rather than merely approved.
pub struct JournalPostingHandler {
    entities: Arc<dyn EntityStore>,
}

impl JournalPostingHandler {
    pub fn new(entities: Arc<dyn EntityStore>) -> Self {
        Self { entities }
    }
}

#[async_trait]
impl CompletionHandler for JournalPostingHandler {
    fn entity_type(&self) -> EntityType {
        EntityType::Journal
    }

    async fn complete(&self, command: &CompletionCommand) -> Result<DispatchReport, StoreError> {
        apply_to_stored_entity(self.entities.as_ref(), command, EntityStatus::Posted, true).await
    }
}

async fn apply_to_stored_entity(
    entities: &dyn EntityStore,
    command: &CompletionCommand,
    approved: EntityStatus,
    posts: bool,
) -> Result<DispatchReport, StoreError> {
    let Some(mut entity) = entities.find_entity(command.entity_type, &command.entity_id).await?
    else {
        return Ok(DispatchReport::EntityMissing);
    };

    if entity.approval_request_id.as_ref().is_some_and(|current| *current != command.request_id) {
        return Ok(DispatchReport::Superseded);
    }

    if !apply_outcome(&mut entity, command, approved, posts) {
        return Ok(DispatchReport::AlreadyApplied);
    }

    entities.save_entity(&entity).await?;
    Ok(DispatchReport::Applied)
}

/// Returns `false` when the entity already reflects the outcome.
fn apply_outcome(
    entity: &mut ProtectedEntity,
    command: &CompletionCommand,
    approved: EntityStatus,
    posts: bool,
) -> bool {
    match command.outcome {
        CompletionOutcome::Approved => {
            if entity.status == approved {
                return false;
            }
            entity.status = approved;
            entity.approved_by = Some(command.actor_id.clone());
            entity.approved_at = Some(command.decided_at);
            entity.rejection_reason = None;
            if posts {
                entity.is_posted = true;
            }
        }
        CompletionOutcome::Rejected => {
            if entity.status == EntityStatus::Rejected {
                return false;
            }
            entity.status = EntityStatus::Rejected;
            entity.rejection_reason = command.reason.clone();
        }
    }

    if entity.approval_request_id.is_none() {
        entity.approval_request_id = Some(command.request_id.clone());
    }
    entity.updated_at = Utc::now();
    true
}

/// Registry mapping each entity kind to exactly one completion handler.
#[derive(Default)]
pub struct CompletionDispatcher {
    handlers: HashMap<EntityType, Arc<dyn CompletionHandler>>,
}

impl CompletionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_handlers(entities: Arc<dyn EntityStore>) -> Self {
        let mut dispatcher = Self::new();
        for entity_type in EntityType::ALL {
            let handler: Arc<dyn CompletionHandler> = match entity_type {
                EntityType::Journal => Arc::new(JournalPostingHandler::new(entities.clone())),
                other => Arc::new(ApprovedStateHandler::new(other, entities.clone())),
            };
            dispatcher.register(handler);
        }
        dispatcher
    }

    /// Registers `handler`, returning the one it replaced.
    pub fn register(
        &mut self,
        handler: Arc<dyn CompletionHandler>,
    ) -> Option<Arc<dyn CompletionHandler>> {
        self.handlers.insert(handler.entity_type(), handler)
    }

    pub fn handles(&self, entity_type: EntityType) -> bool {
        self.handlers.contains_key(&entity_type)
    }

    pub async fn dispatch(
        &self,
        command: &CompletionCommand,
    ) -> Result<DispatchReport, StoreError> {
        let Some(handler) = self.handlers.get(&command.entity_type) else {
            warn!(
                event_name = "approval.dispatch.unknown_entity_type",
                request_id = %command.request_id,
                entity_type = %command.entity_type,
                entity_id = %command.entity_id,
                "no completion handler registered; ignoring"
            );
            return Ok(DispatchReport::UnknownEntityType);
        };

        let report = handler.complete(command).await?;
        match report {
            DispatchReport::EntityMissing => info!(
                event_name = "approval.dispatch.entity_missing",
                request_id = %command.request_id,
                entity_type = %command.entity_type,
                entity_id = %command.entity_id,
                "originating entity no longer exists"
            ),
            DispatchReport::Superseded => warn!(
                event_name = "approval.dispatch.superseded",
                request_id = %command.request_id,
                entity_type = %command.entity_type,
                entity_id = %command.entity_id,
                "entity points at a newer approval request; outcome not applied"
            ),
            _ => {}
        }
        Ok(report)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchPolicy {
    pub max_retries: u32,
    pub retry_base_delay_secs: i64,
    pub retry_backoff_multiplier: u32,
    /// Age after which a queued task or a running claim is considered abandoned.
    pub stale_after_secs: i64,
    pub batch_size: u32,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_base_delay_secs: 30,
            retry_backoff_multiplier: 2,
            stale_after_secs: 300,
            batch_size: 50,
        }
    }
}

pub fn new_task(
    request: &ApprovalRequest,
    outcome: CompletionOutcome,
    actor_id: &str,
    reason: Option<String>,
    policy: &DispatchPolicy,
    now: DateTime<Utc>,
) -> DispatchTask {
    DispatchTask {
        id: DispatchTaskId(format!("DSP-{}", Uuid::new_v4())),
        request_id: request.id.clone(),
        entity_type: request.entity_type,
        entity_id: request.entity_id.clone(),
        outcome,
        actor_id: actor_id.to_owned(),
        reason,
        state: DispatchTaskState::Queued,
        retry_count: 0,
        max_retries: policy.max_retries,
        available_at: now,
        claimed_by: None,
        claimed_at: None,
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn complete_task(task: &mut DispatchTask, now: DateTime<Utc>) {
    task.state = DispatchTaskState::Completed;
    task.claimed_by = None;
    task.claimed_at = None;
    task.last_error = None;
    task.updated_at = now;
}

/// Moves a task to `retryable_failed` with exponential backoff, or to
/// `failed_terminal` once its retries are spent.
pub fn fail_task(
    task: &mut DispatchTask,
    error: impl Into<String>,
    policy: &DispatchPolicy,
    now: DateTime<Utc>,
) {
    task.last_error = Some(error.into());
    task.claimed_by = None;
    task.claimed_at = None;
    task.updated_at = now;

    if task.retry_count < task.max_retries {
        let factor = i64::from(policy.retry_backoff_multiplier.max(1))
            .saturating_pow(task.retry_count);
        let delay = policy.retry_base_delay_secs.saturating_mul(factor);
        task.state = DispatchTaskState::RetryableFailed;
        task.retry_count += 1;
        task.available_at = now + Duration::seconds(delay);
    } else {
        task.state = DispatchTaskState::FailedTerminal;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskRun {
    Applied { task: DispatchTask, report: DispatchReport },
    Failed { task: DispatchTask, error: String },
}

impl TaskRun {
    pub fn task(&self) -> &DispatchTask {
        match self {
            Self::Applied { task, .. } | Self::Failed { task, .. } => task,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub claimed: u32,
    pub applied: u32,
    pub retry_scheduled: u32,
    pub failed_terminal: u32,
}

/// Drives outbox tasks through the dispatcher, recording each attempt on the task.
pub struct CompletionReconciler {
    dispatcher: Arc<CompletionDispatcher>,
    queue: Arc<dyn DispatchQueue>,
    policy: DispatchPolicy,
    worker_id: String,
}

impl CompletionReconciler {
    pub fn new(
        dispatcher: Arc<CompletionDispatcher>,
        queue: Arc<dyn DispatchQueue>,
        policy: DispatchPolicy,
    ) -> Self {
        Self { dispatcher, queue, policy, worker_id: format!("reconciler-{}", Uuid::new_v4()) }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Attempts one delivery of `task` and persists the resulting task state.
    pub async fn execute(
        &self,
        mut task: DispatchTask,
        now: DateTime<Utc>,
    ) -> Result<TaskRun, StoreError> {
        let command = CompletionCommand::from(&task);
        let run = match self.dispatcher.dispatch(&command).await {
            Ok(report) => {
                complete_task(&mut task, now);
                TaskRun::Applied { task, report }
            }
            Err(dispatch_error) => {
                let message = dispatch_error.to_string();
                fail_task(&mut task, message.clone(), &self.policy, now);
                error!(
                    event_name = "approval.dispatch.inconsistency",
                    request_id = %task.request_id,
                    entity_type = %task.entity_type,
                    entity_id = %task.entity_id,
                    task_id = %task.id,
                    task_state = task.state.as_str(),
                    retry_count = task.retry_count,
                    error = %message,
                    "decision committed but entity completion failed"
                );
                TaskRun::Failed { task, error: message }
            }
        };

        self.queue.save_task(run.task()).await?;
        Ok(run)
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport, StoreError> {
        let stale_before = now - Duration::seconds(self.policy.stale_after_secs);
        let claimed =
            self.queue.claim_due(&self.worker_id, now, stale_before, self.policy.batch_size).await?;

        let mut report = ReconcileReport { claimed: claimed.len() as u32, ..Default::default() };
        for task in claimed {
            match self.execute(task, now).await? {
                TaskRun::Applied { .. } => report.applied += 1,
                TaskRun::Failed { task, .. } if task.state == DispatchTaskState::FailedTerminal => {
                    report.failed_terminal += 1;
                }
                TaskRun::Failed { .. } => report.retry_scheduled += 1,
            }
        }

        info!(
            event_name = "approval.dispatch.reconciled",
            worker_id = %self.worker_id,
            claimed = report.claimed,
            applied = report.applied,
            retry_scheduled = report.retry_scheduled,
            failed_terminal = report.failed_terminal,
            "reconciliation pass finished"
        );
        Ok(report)
    }
}
