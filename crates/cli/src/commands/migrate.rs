use super::session::{execute, load_config, open_pool};
use super::{CommandResult, GlobalArgs};

pub fn run(args: &GlobalArgs) -> CommandResult {
    let config = match load_config("migrate", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("migrate", async {
        let pool = open_pool(&config).await?;
        pool.close().await;
        Ok(CommandResult::success("migrate", "applied pending migrations"))
    })
}
