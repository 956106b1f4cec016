use tollgate_core::catalog::CatalogEntry;

use super::session::{execute, load_config, Session};
use super::{workflow_failure, CommandResult, GlobalArgs};

/// Shows the persisted threshold catalog, as JSON entries or as a TOML document.
pub fn run(args: &GlobalArgs, as_toml: bool) -> CommandResult {
    let config = match load_config("catalog", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    execute("catalog", async {
        let session = Session::open(&config).await?;
        let catalog = session.workflow.catalog().await.map_err(workflow_failure)?;
        session.close().await;

        if catalog.is_empty() {
            return Err((
                "catalog_empty",
                "no threshold catalog stored; run `tollgate seed` first".to_string(),
                7u8,
            ));
        }

        if as_toml {
            let rendered = catalog
                .to_toml_string()
                .map_err(|error| ("serialization", error.to_string(), 1u8))?;
            return Ok(CommandResult::success("catalog", rendered));
        }

        let entries: Vec<&CatalogEntry> = catalog.entries().collect();
        Ok(CommandResult::success_with_data(
            "catalog",
            format!("{} entity types configured", entries.len()),
            &entries,
        ))
    })
}
