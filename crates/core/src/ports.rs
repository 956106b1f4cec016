//! Storage seams for the workflow.
//!
//! The SQLite implementations live in `tollgate-db`; [`InMemoryWorkflowStore`] backs
//! unit tests and embedded use. Every implementation must make
//! [`ApprovalStore::commit_decision`] a compare-and-set on `state_version`: that is the
//! only thing standing between two workers approving the same level twice.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::catalog::ThresholdCatalog;
use crate::domain::approval::{ApprovalRequest, ApprovalRequestId, EntityType, RequestStatus};
use crate::domain::dispatch::{DispatchTask, DispatchTaskId, DispatchTaskState};
use crate::domain::entity::ProtectedEntity;
use crate::query::{
    awaits_role, compute_stats, matches_search, sort_for_inbox, sort_newest_first,
    sort_recently_completed, ApprovalFilter, ApprovalStats, Page, PageRequest,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("duplicate record: {0}")]
    Duplicate(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Another writer moved `state_version` first; nothing was written.
    Conflict,
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), StoreError>;

    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, StoreError>;

    /// Persists `request` only if the stored `state_version` still equals
    /// `expected_version`, writing `dispatch` in the same unit of work.
    ///
    /// The caller is expected to have bumped `request.state_version` already.
    async fn commit_decision(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        dispatch: Option<&DispatchTask>,
    ) -> Result<CommitOutcome, StoreError>;
}

#[async_trait]
pub trait ApprovalQueries: Send + Sync {
    async fn list_pending_for_role(
        &self,
        role: &str,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, StoreError>;

    async fn list(
        &self,
        filter: &ApprovalFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, StoreError>;

    async fn history(&self, page: PageRequest) -> Result<Page<ApprovalRequest>, StoreError>;

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<ApprovalRequest>, StoreError>;

    async fn stats(&self, now: DateTime<Utc>) -> Result<ApprovalStats, StoreError>;
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn find_task(&self, id: &DispatchTaskId) -> Result<Option<DispatchTask>, StoreError>;

    async fn save_task(&self, task: &DispatchTask) -> Result<(), StoreError>;

    /// Atomically moves due tasks to `running` under `worker_id` and returns them.
    ///
    /// Due means: `queued` and created at or before `stale_before`; `retryable_failed`
    /// with `available_at <= now`; or `running` with a claim older than `stale_before`.
    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DispatchTask>, StoreError>;

    async fn list_tasks(
        &self,
        state: Option<DispatchTaskState>,
    ) -> Result<Vec<DispatchTask>, StoreError>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_entity(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ProtectedEntity>, StoreError>;

    async fn save_entity(&self, entity: &ProtectedEntity) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn load_catalog(&self) -> Result<ThresholdCatalog, StoreError>;
}

#[async_trait]
impl CatalogSource for ThresholdCatalog {
    async fn load_catalog(&self) -> Result<ThresholdCatalog, StoreError> {
        Ok(self.clone())
    }
}

pub fn is_task_due(
    task: &DispatchTask,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> bool {
    match task.state {
        DispatchTaskState::Queued => task.created_at <= stale_before,
        DispatchTaskState::RetryableFailed => task.available_at <= now,
        DispatchTaskState::Running => task.claimed_at.is_some_and(|at| at <= stale_before),
        DispatchTaskState::Completed | DispatchTaskState::FailedTerminal => false,
    }
}

/// Process-local backend implementing every storage port.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    requests: RwLock<HashMap<String, ApprovalRequest>>,
    tasks: RwLock<HashMap<String, DispatchTask>>,
    entities: RwLock<HashMap<(EntityType, String), ProtectedEntity>>,
}

impl InMemoryWorkflowStore {
    async fn filtered(&self, keep: impl Fn(&ApprovalRequest) -> bool) -> Vec<ApprovalRequest> {
        let requests = self.requests.read().await;
        requests.values().filter(|request| keep(request)).cloned().collect()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryWorkflowStore {
    async fn insert(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id.0) {
            return Err(StoreError::Duplicate(request.id.0.clone()));
        }
        requests.insert(request.id.0.clone(), request.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn commit_decision(
        &self,
        request: &ApprovalRequest,
        expected_version: u32,
        dispatch: Option<&DispatchTask>,
    ) -> Result<CommitOutcome, StoreError> {
        let mut requests = self.requests.write().await;
        let mut tasks = self.tasks.write().await;

        let Some(stored) = requests.get_mut(&request.id.0) else {
            return Ok(CommitOutcome::Conflict);
        };
        if stored.state_version != expected_version {
            return Ok(CommitOutcome::Conflict);
        }
        if let Some(task) = dispatch {
            if tasks.contains_key(&task.id.0) {
                return Err(StoreError::Duplicate(task.id.0.clone()));
            }
            tasks.insert(task.id.0.clone(), task.clone());
        }
        *stored = request.clone();
        Ok(CommitOutcome::Committed)
    }
}

#[async_trait]
impl ApprovalQueries for InMemoryWorkflowStore {
    async fn list_pending_for_role(
        &self,
        role: &str,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, StoreError> {
        let mut matching = self.filtered(|request| awaits_role(request, role)).await;
        sort_for_inbox(&mut matching);
        Ok(Page::from_sorted(matching, page))
    }

    async fn list(
        &self,
        filter: &ApprovalFilter,
        page: PageRequest,
    ) -> Result<Page<ApprovalRequest>, StoreError> {
        let mut matching = self.filtered(|request| filter.matches(request)).await;
        sort_newest_first(&mut matching);
        Ok(Page::from_sorted(matching, page))
    }

    async fn history(&self, page: PageRequest) -> Result<Page<ApprovalRequest>, StoreError> {
        let mut decided = self
            .filtered(|request| {
                matches!(request.status, RequestStatus::Approved | RequestStatus::Rejected)
            })
            .await;
        sort_recently_completed(&mut decided);
        Ok(Page::from_sorted(decided, page))
    }

    async fn search(&self, query: &str, limit: u32) -> Result<Vec<ApprovalRequest>, StoreError> {
        let mut matching = self.filtered(|request| matches_search(request, query)).await;
        sort_newest_first(&mut matching);
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<ApprovalStats, StoreError> {
        let requests = self.requests.read().await;
        Ok(compute_stats(requests.values(), now))
    }
}

#[async_trait]
impl DispatchQueue for InMemoryWorkflowStore {
    async fn find_task(&self, id: &DispatchTaskId) -> Result<Option<DispatchTask>, StoreError> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id.0).cloned())
    }

    async fn save_task(&self, task: &DispatchTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.0.clone(), task.clone());
        Ok(())
    }

    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DispatchTask>, StoreError> {
        let mut tasks = self.tasks.write().await;
        let mut due: Vec<&mut DispatchTask> =
            tasks.values_mut().filter(|task| is_task_due(task, now, stale_before)).collect();
        due.sort_by_key(|task| (task.available_at, task.created_at));

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|task| {
                task.state = DispatchTaskState::Running;
                task.claimed_by = Some(worker_id.to_owned());
                task.claimed_at = Some(now);
                task.updated_at = now;
                task.clone()
            })
            .collect())
    }

    async fn list_tasks(
        &self,
        state: Option<DispatchTaskState>,
    ) -> Result<Vec<DispatchTask>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut listed: Vec<DispatchTask> = tasks
            .values()
            .filter(|task| state.map_or(true, |state| task.state == state))
            .cloned()
            .collect();
        listed.sort_by_key(|task| task.created_at);
        Ok(listed)
    }
}

#[async_trait]
impl EntityStore for InMemoryWorkflowStore {
    async fn find_entity(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ProtectedEntity>, StoreError> {
        let entities = self.entities.read().await;
        Ok(entities.get(&(entity_type, id.to_owned())).cloned())
    }

    async fn save_entity(&self, entity: &ProtectedEntity) -> Result<(), StoreError> {
        let mut entities = self.entities.write().await;
        entities.insert((entity.entity_type, entity.id.clone()), entity.clone());
        Ok(())
    }
}
