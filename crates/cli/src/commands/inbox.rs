//! Read-only views over approval requests.

use chrono::Utc;
use tollgate_core::domain::approval::ApprovalRequestId;
use tollgate_core::query::{ApprovalFilter, PageRequest};

use super::session::{execute, load_config, Session};
use super::{workflow_failure, CommandResult, GlobalArgs};

pub fn pending(args: &GlobalArgs, role: &str, page: PageRequest) -> CommandResult {
    let config = match load_config("pending", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("pending", async {
        let session = Session::open(&config).await?;
        let found = session.workflow.list_pending_for_role(role, page).await;
        session.close().await;

        let page = found.map_err(workflow_failure)?;
        Ok(CommandResult::success_with_data(
            "pending",
            format!("{} request(s) awaiting `{role}`", page.total),
            &page,
        ))
    })
}

pub fn list(args: &GlobalArgs, filter: ApprovalFilter, page: PageRequest) -> CommandResult {
    let config = match load_config("list", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("list", async {
        let session = Session::open(&config).await?;
        let found = session.workflow.list(&filter, page).await;
        session.close().await;

        let page = found.map_err(workflow_failure)?;
        Ok(CommandResult::success_with_data(
            "list",
            format!("{} matching request(s)", page.total),
            &page,
        ))
    })
}

pub fn show(args: &GlobalArgs, id: &str) -> CommandResult {
    let config = match load_config("show", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("show", async {
        let session = Session::open(&config).await?;
        let found = session.workflow.get(&ApprovalRequestId(id.to_string())).await;
        session.close().await;

        let request = found.map_err(workflow_failure)?;
        Ok(CommandResult::success_with_data(
            "show",
            format!(
                "{} is {} at level {}/{}",
                request.id,
                request.status.as_str(),
                request.current_level,
                request.total_levels
            ),
            &request,
        ))
    })
}

pub fn history(args: &GlobalArgs, page: PageRequest) -> CommandResult {
    let config = match load_config("history", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("history", async {
        let session = Session::open(&config).await?;
        let found = session.workflow.history(page).await;
        session.close().await;

        let page = found.map_err(workflow_failure)?;
        Ok(CommandResult::success_with_data(
            "history",
            format!("{} decided request(s)", page.total),
            &page,
        ))
    })
}

pub fn search(args: &GlobalArgs, query: &str, limit: u32) -> CommandResult {
    let config = match load_config("search", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("search", async {
        let session = Session::open(&config).await?;
        let found = session.workflow.search(query, limit).await;
        session.close().await;

        let requests = found.map_err(workflow_failure)?;
        Ok(CommandResult::success_with_data(
            "search",
            format!("{} request(s) match `{query}`", requests.len()),
            &requests,
        ))
    })
}

pub fn stats(args: &GlobalArgs) -> CommandResult {
    let config = match load_config("stats", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("stats", async {
        let session = Session::open(&config).await?;
        let found = session.workflow.stats(Utc::now()).await;
        session.close().await;

        let stats = found.map_err(workflow_failure)?;
        Ok(CommandResult::success_with_data("stats", "approval statistics", &stats))
    })
}
