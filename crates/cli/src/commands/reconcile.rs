use chrono::Utc;

use super::session::{execute, load_config, Session};
use super::{workflow_failure, CommandResult, GlobalArgs};

/// One pass over the completion dispatch queue.
pub fn run(args: &GlobalArgs) -> CommandResult {
    let config = match load_config("reconcile", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("reconcile", async {
        let session = Session::open(&config).await?;
        let ran = session.workflow.reconcile(Utc::now()).await;
        session.close().await;

        let report = ran.map_err(workflow_failure)?;
        let message = format!(
            "claimed {}, applied {}, retry scheduled {}, failed terminal {}",
            report.claimed, report.applied, report.retry_scheduled, report.failed_terminal
        );
        Ok(CommandResult::success_with_data("reconcile", message, &report))
    })
}
