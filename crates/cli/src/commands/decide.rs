use serde_json::json;
use tollgate_core::domain::approval::{Actor, ApprovalRequestId};
use tollgate_core::lifecycle::Transition;
use tollgate_core::service::Decision;

use super::session::{execute, load_config, Session};
use super::{workflow_failure, CommandResult, GlobalArgs};

#[derive(Clone, Debug)]
pub enum DecisionArgs {
    Approve { actor: Actor, comments: Option<String> },
    Reject { actor: Actor, reason: String },
    Cancel { actor: Actor, reason: String },
}

impl DecisionArgs {
    fn command(&self) -> &'static str {
        match self {
            Self::Approve { .. } => "approve",
            Self::Reject { .. } => "reject",
            Self::Cancel { .. } => "cancel",
        }
    }
}

pub fn run(args: &GlobalArgs, id: &str, decision: DecisionArgs) -> CommandResult {
    let command = decision.command();
    let config = match load_config(command, args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute(command, async {
        let session = Session::open(&config).await?;
        let id = ApprovalRequestId(id.to_string());
        let workflow = &session.workflow;
        let outcome = match &decision {
            DecisionArgs::Approve { actor, comments } => {
                workflow.approve(&id, actor, comments.clone()).await
            }
            DecisionArgs::Reject { actor, reason } => workflow.reject(&id, actor, reason).await,
            DecisionArgs::Cancel { actor, reason } => workflow.cancel(&id, actor, reason).await,
        };

        let result = match outcome {
            Ok(decision) => Ok(render(command, decision).await),
            Err(error) => Err(workflow_failure(error)),
        };
        session.close().await;
        result
    })
}

/// Re-notifies the approver role of the active level.
pub fn remind(args: &GlobalArgs, id: &str) -> CommandResult {
    let config = match load_config("remind", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("remind", async {
        let session = Session::open(&config).await?;
        let sent = session.workflow.remind(&ApprovalRequestId(id.to_string())).await;
        session.close().await;

        let report = sent.map_err(workflow_failure)?;
        Ok(CommandResult::success_with_data(
            "remind",
            format!("reminder published to {}", report.channels.join(", ")),
            &json!({ "channels": report.channels }),
        ))
    })
}

async fn render(command: &str, decision: Decision) -> CommandResult {
    let Decision { request, transition, dispatch, notification } = decision;
    notification.wait().await;

    let message = match transition {
        Transition::Advanced { from_level, to_level } => {
            format!("{} level {from_level} approved; level {to_level} is now active", request.id)
        }
        Transition::Completed { level, status } => {
            format!("{} {} at level {level}", request.id, status.as_str())
        }
    };
    CommandResult::success_with_data(
        command,
        message,
        &json!({ "request": request, "dispatch": dispatch.as_str() }),
    )
}
