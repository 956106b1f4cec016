use thiserror::Error;

use crate::domain::approval::{ApprovalRequestId, EntityType, RequestStatus};
use crate::ports::StoreError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("no active approval configuration for entity type `{entity_type}`")]
    ConfigurationMissing { entity_type: EntityType },
    #[error("approval request `{0}` not found")]
    NotFound(ApprovalRequestId),
    #[error("approval request `{id}` already processed (status {status:?})")]
    AlreadyProcessed { id: ApprovalRequestId, status: RequestStatus },
    #[error(
        "actor `{actor_id}` with role `{actor_role}` may not act on level {level} \
         (requires `{required_role}`)"
    )]
    Unauthorized { actor_id: String, actor_role: String, level: u32, required_role: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("approval request `{id}` is in an invalid state: {detail}")]
    InvalidState { id: ApprovalRequestId, detail: String },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl WorkflowError {
    pub fn error_class(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing { .. } => "configuration_missing",
            Self::NotFound(_) => "not_found",
            Self::AlreadyProcessed { .. } => "already_processed",
            Self::Unauthorized { .. } => "unauthorized",
            Self::Validation(_) => "validation_error",
            Self::InvalidState { .. } => "invalid_state",
            Self::Storage(_) => "storage",
        }
    }

    /// Expected outcomes of normal use, as opposed to faults worth paging on.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::InvalidState { .. } | Self::Storage(_))
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing { .. } => {
                "Approval routing is not configured for this kind of record."
            }
            Self::NotFound(_) => "The approval request could not be found.",
            Self::AlreadyProcessed { .. } => "This approval request has already been processed.",
            Self::Unauthorized { .. } => {
                "You are not authorized to act on the current approval level."
            }
            Self::Validation(_) => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::InvalidState { .. } | Self::Storage(_) => {
                "An unexpected internal error occurred."
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::approval::{ApprovalRequestId, RequestStatus};
    use crate::errors::WorkflowError;
    use crate::ports::StoreError;

    #[test]
    fn already_processed_is_a_normal_outcome_with_specific_message() {
        let error = WorkflowError::AlreadyProcessed {
            id: ApprovalRequestId("APR-1".to_owned()),
            status: RequestStatus::Approved,
        };

        assert!(error.is_expected());
        assert_eq!(error.error_class(), "already_processed");
        assert_eq!(error.user_message(), "This approval request has already been processed.");
    }

    #[test]
    fn storage_failures_are_internal() {
        let error = WorkflowError::from(StoreError::Backend("database is locked".to_owned()));

        assert!(!error.is_expected());
        assert_eq!(error.user_message(), "An unexpected internal error occurred.");
    }
}
