use serde::Serialize;
use tollgate_core::config::AppConfig;
use tollgate_core::domain::approval::EntityType;
use tollgate_db::repositories::SqlCatalogRepository;
use tollgate_db::{connect_with_config, migrations};

use super::GlobalArgs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(args: &GlobalArgs, json_output: bool) -> String {
    let report = build_report(args);

    if json_output {
        return serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\
                 \"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
    }

    render_human(&report)
}

fn build_report(args: &GlobalArgs) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(args.load_options()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["database_connectivity", "catalog_coverage"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Connectivity, then whether every entity type has an active catalog entry.
fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "database_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_with_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "database_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to database: {error}"),
                    },
                    DoctorCheck {
                        name: "catalog_coverage",
                        status: CheckStatus::Skipped,
                        details: "skipped because the database is unreachable".to_string(),
                    },
                ];
            }
        };

        let mut checks = vec![DoctorCheck {
            name: "database_connectivity",
            status: CheckStatus::Pass,
            details: format!("connected using `{}`", config.database.url),
        }];

        let coverage = match migrations::run_pending(&pool).await {
            Ok(()) => match SqlCatalogRepository::new(pool.clone()).load().await {
                Ok(catalog) => {
                    let missing: Vec<&str> = EntityType::ALL
                        .iter()
                        .filter(|kind| catalog.active_entry(**kind).is_none())
                        .map(|kind| kind.as_str())
                        .collect();
                    if missing.is_empty() {
                        DoctorCheck {
                            name: "catalog_coverage",
                            status: CheckStatus::Pass,
                            details: "every entity type has an active threshold entry".to_string(),
                        }
                    } else {
                        DoctorCheck {
                            name: "catalog_coverage",
                            status: CheckStatus::Fail,
                            details: format!("no active entry for: {}", missing.join(", ")),
                        }
                    }
                }
                Err(error) => DoctorCheck {
                    name: "catalog_coverage",
                    status: CheckStatus::Fail,
                    details: error.to_string(),
                },
            },
            Err(error) => DoctorCheck {
                name: "catalog_coverage",
                status: CheckStatus::Fail,
                details: format!("migrations failed: {error}"),
            },
        };
        checks.push(coverage);

        pool.close().await;
        checks
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
