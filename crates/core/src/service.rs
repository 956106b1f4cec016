//! `ApprovalWorkflow`: the in-process calling contract for protected features.
//!
//! Decisions follow one path: read the request, validate and mutate it in memory,
//! then commit with a compare-and-set on `state_version` together with the
//! completion outbox row. Dispatch runs after the commit; notification fan-out is
//! spawned after that and never affects the result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::catalog::ThresholdCatalog;
use crate::dispatch::{
    approved_status, new_task, CompletionDispatcher, CompletionReconciler, DispatchPolicy,
    DispatchReport, ReconcileReport, TaskRun,
};
use crate::domain::approval::{Actor, ApprovalRequest, ApprovalRequestId, RequestStatus};
use crate::domain::dispatch::{CompletionOutcome, DispatchTask};
use crate::domain::entity::{EntityStatus, ProtectedEntity};
use crate::errors::WorkflowError;
use crate::lifecycle::{self, NewApprovalRequest, Transition};
use crate::notify::{NotificationFanout, NotificationHandle, NotificationKind, NotifyReport};
use crate::planner::{requires_approval, LevelPlanner, PriorityThresholds};
use crate::ports::{
    ApprovalQueries, ApprovalStore, CatalogSource, CommitOutcome, DispatchQueue, EntityStore,
    StoreError,
};
use crate::query::{ApprovalFilter, ApprovalStats, Page, PageRequest};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub priority: PriorityThresholds,
    /// Default amount at or above which a protected action needs approval.
    pub approval_threshold: Decimal,
    pub dispatch: DispatchPolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            priority: PriorityThresholds::default(),
            approval_threshold: Decimal::new(50_000, 0),
            dispatch: DispatchPolicy::default(),
        }
    }
}

pub struct WorkflowPorts {
    pub approvals: Arc<dyn ApprovalStore>,
    pub queries: Arc<dyn ApprovalQueries>,
    pub dispatch_queue: Arc<dyn DispatchQueue>,
    pub entities: Arc<dyn EntityStore>,
    pub catalog: Arc<dyn CatalogSource>,
    pub notifier: NotificationFanout,
    pub audit: Arc<dyn AuditSink>,
}

/// How the originating entity was brought in line with a terminal decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStatus {
    Applied,
    /// Entity missing or no handler registered; nothing to update.
    Skipped,
    /// The handler failed; the outbox task will be retried by the reconciler.
    QueuedForRetry,
    /// Non-terminal transition or cancellation.
    NotRequired,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::QueuedForRetry => "queued-for-retry",
            Self::NotRequired => "not-required",
        }
    }
}

/// Receipt for a committed approve, reject or cancel.
#[derive(Debug)]
pub struct Decision {
    pub request: ApprovalRequest,
    pub transition: Transition,
    pub dispatch: DispatchStatus,
    pub notification: NotificationHandle,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProtectedSubmission {
    pub entity: ProtectedEntity,
    pub title: String,
    pub requested_by: String,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    PendingApproval { entity: ProtectedEntity, request: ApprovalRequest },
    AutoApproved { entity: ProtectedEntity },
}

enum Action {
    Approve { comments: Option<String> },
    Reject { reason: String },
    Cancel { reason: String },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Cancel { .. } => "cancel",
        }
    }
}

pub struct ApprovalWorkflow {
    approvals: Arc<dyn ApprovalStore>,
    queries: Arc<dyn ApprovalQueries>,
    dispatch_queue: Arc<dyn DispatchQueue>,
    entities: Arc<dyn EntityStore>,
    catalog: Arc<dyn CatalogSource>,
    notifier: NotificationFanout,
    audit: Arc<dyn AuditSink>,
    planner: LevelPlanner,
    reconciler: Arc<CompletionReconciler>,
    settings: WorkflowSettings,
}

impl ApprovalWorkflow {
    pub fn new(ports: WorkflowPorts, settings: WorkflowSettings) -> Self {
        let dispatcher = CompletionDispatcher::with_default_handlers(ports.entities.clone());
        let reconciler = CompletionReconciler::new(
            Arc::new(dispatcher),
            ports.dispatch_queue.clone(),
            settings.dispatch.clone(),
        );

        Self {
            approvals: ports.approvals,
            queries: ports.queries,
            dispatch_queue: ports.dispatch_queue,
            entities: ports.entities,
            catalog: ports.catalog,
            notifier: ports.notifier,
            audit: ports.audit,
            planner: LevelPlanner::new(settings.priority),
            reconciler: Arc::new(reconciler),
            settings,
        }
    }

    /// Replaces the default per-entity completion handlers.
    pub fn with_dispatcher(mut self, dispatcher: CompletionDispatcher) -> Self {
        self.reconciler = Arc::new(CompletionReconciler::new(
            Arc::new(dispatcher),
            self.dispatch_queue.clone(),
            self.settings.dispatch.clone(),
        ));
        self
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn reconciler(&self) -> Arc<CompletionReconciler> {
        self.reconciler.clone()
    }

    pub fn requires_approval(&self, amount: Decimal) -> bool {
        requires_approval(amount, self.settings.approval_threshold)
    }

    pub async fn catalog(&self) -> Result<ThresholdCatalog, WorkflowError> {
        Ok(self.catalog.load_catalog().await?)
    }

    pub async fn create(
        &self,
        input: NewApprovalRequest,
    ) -> Result<ApprovalRequest, WorkflowError> {
        let entity_type = input.entity_type;
        let catalog = self.catalog.load_catalog().await?;
        let plan = match self.planner.plan_levels(&catalog, entity_type, input.amount) {
            Ok(plan) => plan,
            Err(error) => {
                warn!(
                    event_name = "approval.request.create_failed",
                    entity_type = %entity_type,
                    entity_id = %input.entity_id,
                    error_class = error.error_class(),
                    error = %error,
                    "could not plan approval levels"
                );
                return Err(error);
            }
        };

        let request = lifecycle::open_request(input, plan, Utc::now())?;
        self.approvals.insert(&request).await?;

        let correlation_id = Uuid::new_v4().to_string();
        info!(
            event_name = "approval.request.created",
            correlation_id = %correlation_id,
            request_id = %request.id,
            entity_type = %request.entity_type,
            entity_id = %request.entity_id,
            total_levels = request.total_levels,
            priority = request.priority.as_str(),
            amount = %request.amount,
            "approval request created"
        );
        self.audit.emit(
            AuditEvent::new(
                correlation_id,
                "approval.request.created",
                AuditCategory::Lifecycle,
                request.requested_by.clone(),
                AuditOutcome::Success,
            )
            .for_request(&request)
            .with_metadata("total_levels", request.total_levels.to_string())
            .with_metadata("priority", request.priority.as_str()),
        );
        self.notifier.announce(&request);

        Ok(request)
    }

    /// Creation half of the integration contract: routes an entity through approval
    /// when its amount requires it, otherwise applies the approved state directly.
    pub async fn submit(
        &self,
        submission: ProtectedSubmission,
        threshold: Option<Decimal>,
    ) -> Result<SubmitOutcome, WorkflowError> {
        let ProtectedSubmission { mut entity, title, requested_by, description, metadata } =
            submission;
        let threshold = threshold.unwrap_or(self.settings.approval_threshold);
        let now = Utc::now();

        let stored = self.entities.find_entity(entity.entity_type, &entity.id).await?;
        let awaiting = stored.filter(|stored| stored.status == EntityStatus::PendingApproval);
        if let Some(stored) = awaiting {
            let pending = stored
                .approval_request_id
                .map(|id| format!(" ({id})"))
                .unwrap_or_default();
            return Err(WorkflowError::Validation(format!(
                "{} {} is already awaiting approval{pending}",
                entity.entity_type, entity.id
            )));
        }

        if !requires_approval(entity.amount, threshold) {
            entity.status = approved_status(entity.entity_type);
            entity.is_posted = entity.status == EntityStatus::Posted;
            entity.approved_by = Some(requested_by);
            entity.approved_at = Some(now);
            entity.updated_at = now;
            self.entities.save_entity(&entity).await?;
            info!(
                event_name = "approval.submit.auto_approved",
                entity_type = %entity.entity_type,
                entity_id = %entity.id,
                amount = %entity.amount,
                threshold = %threshold,
                "amount below approval threshold"
            );
            return Ok(SubmitOutcome::AutoApproved { entity });
        }

        let request = self
            .create(NewApprovalRequest {
                entity_type: entity.entity_type,
                entity_id: entity.id.clone(),
                title,
                amount: entity.amount,
                requested_by,
                description,
                metadata,
            })
            .await?;

        entity.status = EntityStatus::PendingApproval;
        entity.approval_request_id = Some(request.id.clone());
        entity.updated_at = now;
        if let Err(error) = self.entities.save_entity(&entity).await {
            self.withdraw_orphan(&request, &error).await;
            return Err(error.into());
        }

        Ok(SubmitOutcome::PendingApproval { entity, request })
    }

    /// Cancels a request whose entity never received its back-reference.
    async fn withdraw_orphan(&self, request: &ApprovalRequest, cause: &StoreError) {
        let system = Actor::new("tollgate", "system");
        let reason = format!("entity could not be marked pending approval: {cause}");
        if let Err(error) = self.cancel(&request.id, &system, &reason).await {
            error!(
                event_name = "approval.submit.orphaned_request",
                request_id = %request.id,
                entity_type = %request.entity_type,
                entity_id = %request.entity_id,
                error = %error,
                "request left pending without an entity back-reference"
            );
        }
    }

    pub async fn approve(
        &self,
        id: &ApprovalRequestId,
        actor: &Actor,
        comments: Option<String>,
    ) -> Result<Decision, WorkflowError> {
        self.decide(id, actor, Action::Approve { comments }).await
    }

    pub async fn reject(
        &self,
        id: &ApprovalRequestId,
        actor: &Actor,
        reason: &str,
    ) -> Result<Decision, WorkflowError> {
        self.decide(id, actor, Action::Reject { reason: reason.to_owned() }).await
    }

    /// Operator transition to `cancelled`. The entity is left for its owner to resolve.
    pub async fn cancel(
        &self,
        id: &ApprovalRequestId,
        actor: &Actor,
        reason: &str,
    ) -> Result<Decision, WorkflowError> {
        self.decide(id, actor, Action::Cancel { reason: reason.to_owned() }).await
    }

    pub async fn remind(&self, id: &ApprovalRequestId) -> Result<NotifyReport, WorkflowError> {
        let request = self.get(id).await?;
        let level = lifecycle::active_level(&request)?;
        info!(
            event_name = "approval.request.reminded",
            request_id = %request.id,
            entity_type = %request.entity_type,
            entity_id = %request.entity_id,
            level = level.level,
            approver_role = %level.approver_role,
            "reminder sent"
        );
        Ok(self.notifier.remind(&request))
    }

    pub async fn get(&self, id: &ApprovalRequestId) -> Result<ApprovalRequest, WorkflowError> {
        self.approvals.find_by_id(id).await?.ok_or_else(|| WorkflowError::NotFound(id.clone()))
    }

    pub async fn list_pending_for_role(
        &self,
        role: &str,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, WorkflowError> {
        Ok(self.queries.list_pending_for_role(role, page).await?)
    }

    pub async fn list(
        &self,
        filter: &ApprovalFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, WorkflowError> {
        Ok(self.queries.list(filter, page).await?)
    }

    pub async fn history(&self, page: PageRequest) -> Result<Page<ApprovalRequest>, WorkflowError> {
        Ok(self.queries.history(page).await?)
    }

    pub async fn search(
        &self,
        query: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, WorkflowError> {
        Ok(self.queries.search(query, limit).await?)
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<ApprovalStats, WorkflowError> {
        Ok(self.queries.stats(now).await?)
    }

    pub async fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileReport, WorkflowError> {
        Ok(self.reconciler.run_once(now).await?)
    }

    async fn decide(
        &self,
        id: &ApprovalRequestId,
        actor: &Actor,
        action: Action,
    ) -> Result<Decision, WorkflowError> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut request = self.get(id).await?;
        let expected_version = request.state_version;
        let observed_level = request.current_level;
        let now = Utc::now();

        let transition = match &action {
            Action::Approve { comments } => {
                lifecycle::approve(&mut request, actor, comments.clone(), now)
            }
            Action::Reject { reason } => lifecycle::reject(&mut request, actor, reason, now),
            Action::Cancel { reason } => lifecycle::cancel(&mut request, reason, now),
        };
        let transition = match transition {
            Ok(transition) => transition,
            Err(error) => {
                self.record_refusal(&request, actor, &action, &correlation_id, &error);
                return Err(error);
            }
        };

        request.state_version = expected_version + 1;
        request.updated_at = now;
        let task = self.completion_task(&request, transition, actor, &action, now);

        let outcome =
            self.approvals.commit_decision(&request, expected_version, task.as_ref()).await?;
        if outcome == CommitOutcome::Conflict {
            let error = self.resolve_conflict(id, observed_level).await;
            self.record_refusal(&request, actor, &action, &correlation_id, &error);
            return Err(error);
        }

        self.record_commit(&request, transition, actor, &action, &correlation_id);

        let dispatch = match task {
            Some(task) => self.dispatch_now(task, now).await,
            None => DispatchStatus::NotRequired,
        };
        let notification = match transition.terminal_status() {
            Some(RequestStatus::Approved) => {
                self.notifier.spawn_notify(NotificationKind::Approved, request.clone())
            }
            Some(RequestStatus::Rejected) => {
                self.notifier.spawn_notify(NotificationKind::Rejected, request.clone())
            }
            Some(RequestStatus::Cancelled) => {
                self.notifier.spawn_notify(NotificationKind::Cancelled, request.clone())
            }
            Some(RequestStatus::Pending) | None => NotificationHandle::none(),
        };

        Ok(Decision { request, transition, dispatch, notification })
    }

    fn completion_task(
        &self,
        request: &ApprovalRequest,
        transition: Transition,
        actor: &Actor,
        action: &Action,
        now: DateTime<Utc>,
    ) -> Option<DispatchTask> {
        let (outcome, reason) = match (transition.terminal_status(), action) {
            (Some(RequestStatus::Approved), _) => (CompletionOutcome::Approved, None),
            (Some(RequestStatus::Rejected), Action::Reject { reason }) => {
                (CompletionOutcome::Rejected, Some(reason.trim().to_owned()))
            }
            _ => return None,
        };
        Some(new_task(request, outcome, &actor.id, reason, &self.settings.dispatch, now))
    }

    /// Classifies a lost compare-and-set after re-reading the request.
    async fn resolve_conflict(
        &self,
        id: &ApprovalRequestId,
        observed_level: u32,
    ) -> WorkflowError {
        let current = match self.approvals.find_by_id(id).await {
            Ok(Some(current)) => current,
            Ok(None) => return WorkflowError::NotFound(id.clone()),
            Err(error) => return error.into(),
        };

        if current.is_terminal() || current.current_level != observed_level {
            return WorkflowError::AlreadyProcessed { id: id.clone(), status: current.status };
        }

        WorkflowError::InvalidState {
            id: id.clone(),
            detail: format!(
                "state_version moved but level {observed_level} is still pending (version {})",
                current.state_version
            ),
        }
    }

    async fn dispatch_now(&self, task: DispatchTask, now: DateTime<Utc>) -> DispatchStatus {
        let request_id = task.request_id.clone();
        let task_id = task.id.clone();
        match self.reconciler.execute(task, now).await {
            Ok(TaskRun::Applied { report, .. }) => match report {
                DispatchReport::Applied | DispatchReport::AlreadyApplied => DispatchStatus::Applied,
                DispatchReport::EntityMissing
                | DispatchReport::Superseded
                | DispatchReport::UnknownEntityType => DispatchStatus::Skipped,
            },
            Ok(TaskRun::Failed { .. }) => DispatchStatus::QueuedForRetry,
            Err(error) => {
                error!(
                    event_name = "approval.dispatch.inconsistency",
                    request_id = %request_id,
                    task_id = %task_id,
                    error = %error,
                    "could not record dispatch attempt; task left for the reconciler"
                );
                DispatchStatus::QueuedForRetry
            }
        }
    }

    fn record_commit(
        &self,
        request: &ApprovalRequest,
        transition: Transition,
        actor: &Actor,
        action: &Action,
        correlation_id: &str,
    ) {
        let event_name = match transition {
            Transition::Advanced { .. } => "approval.level.approved",
            Transition::Completed { status: RequestStatus::Approved, .. } => {
                "approval.request.approved"
            }
            Transition::Completed { status: RequestStatus::Rejected, .. } => {
                "approval.request.rejected"
            }
            Transition::Completed { .. } => "approval.request.cancelled",
        };
        let level = match transition {
            Transition::Advanced { from_level, .. } => from_level,
            Transition::Completed { level, .. } => level,
        };

        info!(
            event_name,
            correlation_id = %correlation_id,
            request_id = %request.id,
            entity_type = %request.entity_type,
            entity_id = %request.entity_id,
            actor_id = %actor.id,
            decided_level = level,
            current_level = request.current_level,
            status = request.status.as_str(),
            state_version = request.state_version,
            "approval decision committed"
        );
        self.audit.emit(
            AuditEvent::new(
                correlation_id,
                event_name,
                AuditCategory::Lifecycle,
                actor.id.clone(),
                AuditOutcome::Success,
            )
            .for_request(request)
            .with_metadata("action", action.name())
            .with_metadata("level", level.to_string())
            .with_metadata("status", request.status.as_str()),
        );
    }

    fn record_refusal(
        &self,
        request: &ApprovalRequest,
        actor: &Actor,
        action: &Action,
        correlation_id: &str,
        error: &WorkflowError,
    ) {
        match error {
            WorkflowError::InvalidState { .. } => error!(
                event_name = "approval.state.invalid",
                correlation_id = %correlation_id,
                request_id = %request.id,
                entity_type = %request.entity_type,
                entity_id = %request.entity_id,
                actor_id = %actor.id,
                action = action.name(),
                error = %error,
                "approval request violates level invariants"
            ),
            WorkflowError::AlreadyProcessed { .. } => info!(
                event_name = "approval.decision.already_processed",
                correlation_id = %correlation_id,
                request_id = %request.id,
                actor_id = %actor.id,
                action = action.name(),
                "request was already processed"
            ),
            _ => warn!(
                event_name = "approval.decision.refused",
                correlation_id = %correlation_id,
                request_id = %request.id,
                actor_id = %actor.id,
                actor_role = %actor.role,
                action = action.name(),
                error_class = error.error_class(),
                error = %error,
                "approval decision refused"
            ),
        }

        let outcome =
            if error.is_expected() { AuditOutcome::Rejected } else { AuditOutcome::Failed };
        self.audit.emit(
            AuditEvent::new(
                correlation_id,
                format!("approval.{}.refused", action.name()),
                AuditCategory::Lifecycle,
                actor.id.clone(),
                outcome,
            )
            .for_request(request)
            .with_metadata("error_class", error.error_class()),
        );
    }
}
