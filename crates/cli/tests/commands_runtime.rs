use std::env;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use rust_decimal::Decimal;
use serde_json::Value;
use tempfile::TempDir;
use tollgate_cli::commands::decide::{self, DecisionArgs};
use tollgate_cli::commands::submit::{self, SubmitArgs};
use tollgate_cli::commands::{catalog, config, inbox, migrate, reconcile, seed, GlobalArgs};
use tollgate_core::domain::approval::{Actor, EntityType, RequestStatus};
use tollgate_core::query::{ApprovalFilter, PageRequest};

#[test]
fn migrate_returns_success_on_fresh_database() {
    with_env(&[], || {
        let db = TempDatabase::new();

        let result = migrate::run(&db.args);
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn invalid_config_fails_with_config_exit_code() {
    with_env(&[("TOLLGATE_DATABASE_MAX_CONNECTIONS", "0")], || {
        let db = TempDatabase::new();

        let result = migrate::run(&db.args);
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
    });
}

#[test]
fn seed_is_idempotent_across_runs() {
    with_env(&[], || {
        let db = TempDatabase::new();

        let first = parse_ok(&seed::run(&db.args, None).output);
        let second = parse_ok(&seed::run(&db.args, None).output);

        assert_eq!(first["data"]["entities"], 5);
        assert_eq!(first["data"], second["data"]);
        assert_eq!(first["message"], second["message"]);
    });
}

#[test]
fn seed_accepts_a_catalog_file_and_catalog_renders_it() {
    with_env(&[], || {
        let db = TempDatabase::new();
        let catalog_path = db.dir.path().join("catalog.toml");
        std::fs::write(
            &catalog_path,
            r#"
[[entry]]
entity_type = "invoice"
levels = [
  { level = 1, approver_role = "Team Lead", amount_threshold = "0" },
  { level = 2, approver_role = "Controller", amount_threshold = "10000" },
]
"#,
        )
        .expect("write catalog");

        let seeded = parse_ok(&seed::run(&db.args, Some(&catalog_path)).output);
        assert_eq!(seeded["data"]["catalog_levels"], 2);

        let shown = parse_ok(&catalog::run(&db.args, false).output);
        let entries = shown["data"].as_array().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["entity_type"], "invoice");
        assert_eq!(entries[0]["levels"][1]["approver_role"], "Controller");
    });
}

#[test]
fn seed_rejects_missing_catalog_file() {
    with_env(&[], || {
        let db = TempDatabase::new();

        let result = seed::run(&db.args, Some(Path::new("/nonexistent/catalog.toml")));

        assert_eq!(result.exit_code, 2);
        assert_eq!(parse_payload(&result.output)["error_class"], "catalog_invalid");
    });
}

#[test]
fn two_level_request_is_approved_end_to_end() {
    with_env(&[], || {
        let db = TempDatabase::new();
        parse_ok(&seed::run(&db.args, None).output);

        let submitted =
            parse_ok(
                &submit::run(&db.args, submission(EntityType::Payment, "PAY-001", 250_000)).output,
            );
        assert_eq!(submitted["data"]["outcome"], "pending_approval");
        assert_eq!(submitted["data"]["entity"]["status"], "pending_approval");
        assert_eq!(submitted["data"]["request"]["total_levels"], 2);
        let id = submitted["data"]["request"]["id"].as_str().expect("request id").to_string();

        let inbox = parse_ok(&inbox::pending(&db.args, "manager", PageRequest::default()).output);
        assert_eq!(inbox["data"]["total"], 1);
        assert_eq!(inbox["data"]["items"][0]["id"], id.as_str());

        let wrong_role = decide::run(&db.args, &id, approve_as("u-finance", "Finance Manager"));
        assert_eq!(wrong_role.exit_code, 7);
        assert_eq!(parse_payload(&wrong_role.output)["error_class"], "unauthorized");

        let first =
            parse_ok(&decide::run(&db.args, &id, approve_as("u-manager", "Manager")).output);
        assert_eq!(first["data"]["request"]["current_level"], 2);
        assert_eq!(first["data"]["dispatch"], "not-required");

        let second =
            parse_ok(
                &decide::run(&db.args, &id, approve_as("u-finance", "Finance Manager")).output,
            );
        assert_eq!(second["data"]["request"]["status"], "approved");
        assert_eq!(second["data"]["dispatch"], "applied");

        let repeat = decide::run(&db.args, &id, approve_as("u-finance", "Finance Manager"));
        assert_eq!(repeat.exit_code, 7);
        assert_eq!(parse_payload(&repeat.output)["error_class"], "already_processed");

        let shown = parse_ok(&inbox::show(&db.args, &id).output);
        assert_eq!(shown["data"]["levels"][0]["approved_by"], "u-manager");
        assert_eq!(shown["data"]["levels"][1]["approved_by"], "u-finance");

        let history = parse_ok(&inbox::history(&db.args, PageRequest::default()).output);
        assert_eq!(history["data"]["total"], 1);

        let stats = parse_ok(&inbox::stats(&db.args).output);
        assert_eq!(stats["data"]["by_status"]["approved"], 1);
        assert_eq!(stats["data"]["top_approvers"][0]["decisions"], 1);

        let reconciled = parse_ok(&reconcile::run(&db.args).output);
        assert_eq!(reconciled["data"]["claimed"], 0);
    });
}

#[test]
fn rejection_and_cancellation_are_terminal() {
    with_env(&[], || {
        let db = TempDatabase::new();
        parse_ok(&seed::run(&db.args, None).output);

        let rejected_id = submit_id(&db, EntityType::Invoice, "INV-001", 75_000);
        let rejected = parse_ok(
            &decide::run(
                &db.args,
                &rejected_id,
                DecisionArgs::Reject {
                    actor: Actor::new("u-manager", "Manager"),
                    reason: "duplicate invoice".to_string(),
                },
            )
            .output,
        );
        assert_eq!(rejected["data"]["request"]["status"], "rejected");
        assert_eq!(rejected["data"]["request"]["levels"][0]["comments"], "duplicate invoice");

        let blank_reason = decide::run(
            &db.args,
            &submit_id(&db, EntityType::Voucher, "VCH-1", 60_000),
            DecisionArgs::Reject {
                actor: Actor::new("u-manager", "Manager"),
                reason: "  ".to_string(),
            },
        );
        assert_eq!(blank_reason.exit_code, 7);
        assert_eq!(parse_payload(&blank_reason.output)["error_class"], "validation_error");

        let cancelled_id = submit_id(&db, EntityType::Journal, "JE-001", 1_200_000);
        let cancelled = parse_ok(
            &decide::run(
                &db.args,
                &cancelled_id,
                DecisionArgs::Cancel {
                    actor: Actor::new("ops-1", "operator"),
                    reason: "raised in error".to_string(),
                },
            )
            .output,
        );
        assert_eq!(cancelled["data"]["request"]["status"], "cancelled");
        assert_eq!(cancelled["data"]["dispatch"], "not-required");

        let filter =
            ApprovalFilter { status: Some(RequestStatus::Pending), ..ApprovalFilter::default() };
        let pending = parse_ok(&inbox::list(&db.args, filter, PageRequest::default()).output);
        assert_eq!(pending["data"]["total"], 1);

        let found = parse_ok(&inbox::search(&db.args, "je-001", 10).output);
        assert_eq!(found["data"].as_array().map(Vec::len), Some(1));
    });
}

#[test]
fn amounts_below_threshold_are_auto_approved() {
    with_env(&[], || {
        let db = TempDatabase::new();
        parse_ok(&seed::run(&db.args, None).output);

        let submitted =
            parse_ok(
                &submit::run(&db.args, submission(EntityType::Journal, "JE-7", 12_500)).output,
            );

        assert_eq!(submitted["data"]["outcome"], "auto_approved");
        assert_eq!(submitted["data"]["entity"]["status"], "posted");
        assert_eq!(submitted["data"]["entity"]["is_posted"], true);
    });
}

#[test]
fn unknown_request_and_missing_catalog_are_reported() {
    with_env(&[], || {
        let db = TempDatabase::new();

        let missing = decide::remind(&db.args, "APR-missing");
        assert_eq!(missing.exit_code, 7);
        assert_eq!(parse_payload(&missing.output)["error_class"], "not_found");

        let unconfigured = submit::run(&db.args, submission(EntityType::Payment, "PAY-9", 90_000));
        assert_eq!(unconfigured.exit_code, 7);
        assert_eq!(parse_payload(&unconfigured.output)["error_class"], "configuration_missing");

        let empty = catalog::run(&db.args, false);
        assert_eq!(parse_payload(&empty.output)["error_class"], "catalog_empty");
    });
}

#[test]
fn config_reports_flag_source_for_database_url() {
    with_env(&[("TOLLGATE_DISPATCH_BATCH_SIZE", "7")], || {
        let db = TempDatabase::new();

        let output = config::run(&db.args);

        assert!(output.contains("(source: flag (--database-url))"), "{output}");
        assert!(output
            .contains("- dispatch.batch_size = 7 (source: env (TOLLGATE_DISPATCH_BATCH_SIZE))"));
        assert!(output.contains("- logging.level = info (source: default)"), "{output}");
    });
}

struct TempDatabase {
    dir: TempDir,
    args: GlobalArgs,
}

impl TempDatabase {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("tollgate.db").display());
        Self { dir, args: GlobalArgs { config_path: None, database_url: Some(url) } }
    }
}

fn submission(entity_type: EntityType, entity_id: &str, amount: i64) -> SubmitArgs {
    SubmitArgs {
        entity_type,
        entity_id: entity_id.to_string(),
        amount: Decimal::new(amount, 0),
        title: format!("{entity_type} {entity_id}"),
        requested_by: "u-clerk".to_string(),
        description: None,
        threshold: None,
    }
}

fn submit_id(db: &TempDatabase, entity_type: EntityType, entity_id: &str, amount: i64) -> String {
    let submitted =
        parse_ok(&submit::run(&db.args, submission(entity_type, entity_id, amount)).output);
    submitted["data"]["request"]["id"].as_str().expect("request id").to_string()
}

fn approve_as(actor: &str, role: &str) -> DecisionArgs {
    DecisionArgs::Approve { actor: Actor::new(actor, role), comments: None }
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn parse_ok(output: &str) -> Value {
    let payload = parse_payload(output);
    assert_eq!(payload["status"], "ok", "{output}");
    payload
}

fn with_env(vars: &[(&str, &str)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard =
        ENV_LOCK.get_or_init(|| Mutex::new(())).lock().expect("env mutex should not be poisoned");

    let keys = [
        "TOLLGATE_DATABASE_URL",
        "TOLLGATE_DATABASE_MAX_CONNECTIONS",
        "TOLLGATE_DATABASE_TIMEOUT_SECS",
        "TOLLGATE_WORKFLOW_HIGH_ABOVE",
        "TOLLGATE_WORKFLOW_MEDIUM_ABOVE",
        "TOLLGATE_WORKFLOW_APPROVAL_THRESHOLD",
        "TOLLGATE_DISPATCH_MAX_RETRIES",
        "TOLLGATE_DISPATCH_RETRY_BASE_DELAY_SECS",
        "TOLLGATE_DISPATCH_STALE_AFTER_SECS",
        "TOLLGATE_DISPATCH_BATCH_SIZE",
        "TOLLGATE_NOTIFICATIONS_OBSERVERS_CHANNEL",
        "TOLLGATE_NOTIFICATIONS_SENDER_ADDRESS",
        "TOLLGATE_LOGGING_LEVEL",
        "TOLLGATE_LOGGING_FORMAT",
        "TOLLGATE_LOG_LEVEL",
        "TOLLGATE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
