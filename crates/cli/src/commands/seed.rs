use std::fs;
use std::path::Path;

use anyhow::Context;
use tollgate_core::catalog::ThresholdCatalog;
use tollgate_db::DemoSeedDataset;

use super::session::{execute, load_config, open_pool};
use super::{CommandResult, GlobalArgs};

pub fn run(args: &GlobalArgs, catalog_path: Option<&Path>) -> CommandResult {
    let config = match load_config("seed", args) {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let catalog = match catalog_path {
        Some(path) => match read_catalog(path) {
            Ok(catalog) => catalog,
            Err(error) => {
                return CommandResult::failure("seed", "catalog_invalid", format!("{error:#}"), 2);
            }
        },
        None => ThresholdCatalog::default_catalog(),
    };

    execute("seed", async {
        let pool = open_pool(&config).await?;

        let seeded = DemoSeedDataset::load(&pool, &catalog)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
        let verification = DemoSeedDataset::verify(&pool, &catalog)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;
        pool.close().await;

        if !verification.all_passed {
            let failed_checks = verification
                .checks
                .iter()
                .filter_map(|check| (!check.passed).then_some(check.name))
                .collect::<Vec<_>>();
            return Err(("seed_verification", verification_message(&failed_checks), 6u8));
        }

        let message = format!(
            "seeded {} catalog levels, {} contacts and {} draft entities",
            seeded.catalog_levels, seeded.contacts, seeded.entities
        );
        Ok(CommandResult::success_with_data("seed", message, &seeded))
    })
}

pub fn read_catalog(path: &Path) -> anyhow::Result<ThresholdCatalog> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("could not read catalog file `{}`", path.display()))?;
    ThresholdCatalog::from_toml_str(&raw)
        .with_context(|| format!("invalid catalog file `{}`", path.display()))
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}
