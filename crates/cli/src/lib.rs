pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tollgate_core::config::{AppConfig, LogFormat};
use tollgate_core::domain::approval::{Actor, EntityType, Priority, RequestStatus};
use tollgate_core::query::{ApprovalFilter, PageRequest, DEFAULT_PAGE_LIMIT};

use commands::decide::DecisionArgs;
use commands::submit::SubmitArgs;
use commands::{CommandResult, GlobalArgs};

#[derive(Debug, Parser)]
#[command(
    name = "tollgate",
    about = "Tollgate approval workflow operator CLI",
    long_about = "Operate the tiered approval workflow: migrations, catalog seeding, inboxes, \
                  decisions, and completion reconciliation.",
    after_help = "Examples:\n  tollgate seed\n  tollgate pending --role \"Finance Manager\"\n  \
                  tollgate approve APR-... --actor u-manager --role Manager"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a tollgate.toml config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override database.url for this invocation")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations")]
    Migrate,
    #[command(about = "Store the threshold catalog and demo contacts and draft records")]
    Seed {
        #[arg(long, help = "TOML catalog to store instead of the built-in default")]
        catalog: Option<PathBuf>,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, database connectivity and catalog coverage")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Show the stored threshold catalog")]
    Catalog {
        #[arg(long, help = "Render as a TOML document accepted by `seed --catalog`")]
        toml: bool,
    },
    #[command(about = "Submit a record, opening an approval request when the amount requires one")]
    Submit {
        #[arg(long, value_parser = entity_type_arg)]
        entity_type: EntityType,
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        amount: Decimal,
        #[arg(long)]
        title: String,
        #[arg(long)]
        requested_by: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, help = "Override workflow.approval_threshold for this submission")]
        threshold: Option<Decimal>,
    },
    #[command(about = "Pending requests whose active level requires a role")]
    Pending {
        #[arg(long)]
        role: String,
        #[command(flatten)]
        page: PageArgs,
    },
    #[command(about = "List requests with optional filters, newest first")]
    List {
        #[arg(long, value_parser = status_arg)]
        status: Option<RequestStatus>,
        #[arg(long, value_parser = entity_type_arg)]
        entity_type: Option<EntityType>,
        #[arg(long, value_parser = priority_arg)]
        priority: Option<Priority>,
        #[arg(long, help = "Inclusive lower bound on requested_at (RFC 3339)")]
        from: Option<DateTime<Utc>>,
        #[arg(long, help = "Inclusive upper bound on requested_at (RFC 3339)")]
        to: Option<DateTime<Utc>>,
        #[command(flatten)]
        page: PageArgs,
    },
    #[command(about = "Show one request with its levels")]
    Show { id: String },
    #[command(about = "Approved and rejected requests, most recently completed first")]
    History {
        #[command(flatten)]
        page: PageArgs,
    },
    #[command(about = "Case-insensitive search on request id or title")]
    Search {
        query: String,
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: u32,
    },
    #[command(about = "Dashboard statistics")]
    Stats,
    #[command(about = "Approve the active level of a request")]
    Approve {
        id: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        comments: Option<String>,
    },
    #[command(about = "Reject a request at its active level")]
    Reject {
        id: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        reason: String,
    },
    #[command(about = "Cancel a pending request as an operator")]
    Cancel {
        id: String,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        reason: String,
    },
    #[command(about = "Re-notify the role that owns the active level")]
    Remind { id: String },
    #[command(about = "Retry due completion dispatch tasks once")]
    Reconcile,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[arg(long, default_value_t = 1)]
    page: u32,
    #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
    limit: u32,
}

impl PageArgs {
    fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.limit)
    }
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let args = GlobalArgs { config_path: cli.config, database_url: cli.database_url };
    init_logging(&args);

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&args),
        Command::Seed { catalog } => commands::seed::run(&args, catalog.as_deref()),
        Command::Config => CommandResult { exit_code: 0, output: commands::config::run(&args) },
        Command::Doctor { json } => {
            CommandResult { exit_code: 0, output: commands::doctor::run(&args, json) }
        }
        Command::Catalog { toml } => commands::catalog::run(&args, toml),
        Command::Submit {
            entity_type,
            entity_id,
            amount,
            title,
            requested_by,
            description,
            threshold,
        } => commands::submit::run(
            &args,
            SubmitArgs {
                entity_type,
                entity_id,
                amount,
                title,
                requested_by,
                description,
                threshold,
            },
        ),
        Command::Pending { role, page } => commands::inbox::pending(&args, &role, page.request()),
        Command::List { status, entity_type, priority, from, to, page } => {
            let filter = ApprovalFilter {
                status,
                entity_type,
                priority,
                requested_from: from,
                requested_to: to,
            };
            commands::inbox::list(&args, filter, page.request())
        }
        Command::Show { id } => commands::inbox::show(&args, &id),
        Command::History { page } => commands::inbox::history(&args, page.request()),
        Command::Search { query, limit } => commands::inbox::search(&args, &query, limit),
        Command::Stats => commands::inbox::stats(&args),
        Command::Approve { id, actor, role, comments } => commands::decide::run(
            &args,
            &id,
            DecisionArgs::Approve { actor: Actor::new(actor, role), comments },
        ),
        Command::Reject { id, actor, role, reason } => commands::decide::run(
            &args,
            &id,
            DecisionArgs::Reject { actor: Actor::new(actor, role), reason },
        ),
        Command::Cancel { id, actor, reason } => commands::decide::run(
            &args,
            &id,
            DecisionArgs::Cancel { actor: Actor::new(actor, "operator"), reason },
        ),
        Command::Remind { id } => commands::decide::remind(&args, &id),
        Command::Reconcile => commands::reconcile::run(&args),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so stdout stays a single JSON document per command.
fn init_logging(args: &GlobalArgs) {
    use tracing::Level;

    let Ok(config) = AppConfig::load(args.load_options()) else {
        return;
    };
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn entity_type_arg(value: &str) -> Result<EntityType, String> {
    EntityType::parse(value).ok_or_else(|| {
        let known: Vec<&str> = EntityType::ALL.iter().map(|kind| kind.as_str()).collect();
        format!("unknown entity type `{value}` (expected one of: {})", known.join(", "))
    })
}

fn status_arg(value: &str) -> Result<RequestStatus, String> {
    RequestStatus::parse(value).ok_or_else(|| format!("unknown request status `{value}`"))
}

fn priority_arg(value: &str) -> Result<Priority, String> {
    Priority::parse(value).ok_or_else(|| format!("unknown priority `{value}`"))
}
