pub mod audit;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod notify;
pub mod planner;
pub mod ports;
pub mod query;
pub mod service;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, TracingAuditSink};
pub use catalog::{CatalogEntry, CatalogError, ThresholdCatalog, ThresholdLevel};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use dispatch::{
    CompletionDispatcher, CompletionHandler, CompletionReconciler, DispatchPolicy, DispatchReport,
    ReconcileReport,
};
pub use domain::approval::{
    Actor, ApprovalLevel, ApprovalRequest, ApprovalRequestId, EntityType, LevelStatus, Priority,
    RequestStatus,
};
pub use domain::dispatch::{CompletionOutcome, DispatchTask, DispatchTaskId, DispatchTaskState};
pub use domain::entity::{EntityStatus, ProtectedEntity};
pub use errors::WorkflowError;
pub use lifecycle::{NewApprovalRequest, Transition};
pub use notify::{
    BroadcastPublisher, ContactDirectory, EmailOutbox, NotificationFanout, NotificationHandle,
    NotificationKind, NotificationSettings, NotifyReport, RealtimePublisher,
};
pub use planner::{requires_approval, LevelPlanner, PriorityThresholds};
pub use ports::{
    ApprovalQueries, ApprovalStore, CatalogSource, CommitOutcome, DispatchQueue, EntityStore,
    InMemoryWorkflowStore, StoreError,
};
pub use query::{ApprovalFilter, ApprovalStats, ApproverTally, Page, PageRequest};
pub use service::{
    ApprovalWorkflow, Decision, DispatchStatus, ProtectedSubmission, SubmitOutcome,
    WorkflowPorts, WorkflowSettings,
};
