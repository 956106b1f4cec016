use rust_decimal::Decimal;
use serde_json::json;
use tollgate_core::domain::approval::EntityType;
use tollgate_core::domain::entity::ProtectedEntity;
use tollgate_core::service::{ProtectedSubmission, SubmitOutcome};

use super::session::{execute, load_config, Session};
use super::{workflow_failure, CommandResult, GlobalArgs};

#[derive(Clone, Debug)]
pub struct SubmitArgs {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub amount: Decimal,
    pub title: String,
    pub requested_by: String,
    pub description: Option<String>,
    pub threshold: Option<Decimal>,
}

/// Routes a record through approval, or stores it as approved when below threshold.
pub fn run(args: &GlobalArgs, submit: SubmitArgs) -> CommandResult {
    let config = match load_config("submit", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("submit", async {
        let session = Session::open(&config).await?;
        let submission = ProtectedSubmission {
            entity: ProtectedEntity::draft(submit.entity_type, submit.entity_id, submit.amount),
            title: submit.title,
            requested_by: submit.requested_by,
            description: submit.description,
            metadata: None,
        };
        let outcome = session.workflow.submit(submission, submit.threshold).await;
        session.close().await;

        let result = match outcome.map_err(workflow_failure)? {
            SubmitOutcome::PendingApproval { entity, request } => CommandResult::success_with_data(
                "submit",
                format!(
                    "{} {} is pending approval as {} ({} level(s))",
                    entity.entity_type, entity.id, request.id, request.total_levels
                ),
                &json!({ "outcome": "pending_approval", "entity": entity, "request": request }),
            ),
            SubmitOutcome::AutoApproved { entity } => CommandResult::success_with_data(
                "submit",
                format!("{} {} is below the approval threshold", entity.entity_type, entity.id),
                &json!({ "outcome": "auto_approved", "entity": entity }),
            ),
        };
        Ok(result)
    })
}
