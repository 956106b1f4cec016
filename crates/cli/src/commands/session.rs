use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tollgate_core::audit::TracingAuditSink;
use tollgate_core::config::{AppConfig, ConfigOverrides, LoadOptions};
use tollgate_core::notify::{BroadcastPublisher, NotificationFanout};
use tollgate_core::service::{ApprovalWorkflow, WorkflowPorts};
use tollgate_db::repositories::{
    SqlApprovalRepository, SqlCatalogRepository, SqlContactDirectory, SqlDispatchQueueRepository,
    SqlEmailOutbox, SqlEntityRepository,
};
use tollgate_db::{connect_with_config, migrations, DbPool};

use super::{CommandResult, Failure};

/// Options shared by every subcommand.
#[derive(Clone, Debug, Default)]
pub struct GlobalArgs {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
}

impl GlobalArgs {
    pub(crate) fn load_options(&self) -> LoadOptions {
        LoadOptions {
            require_file: self.config_path.is_some(),
            config_path: self.config_path.clone(),
            overrides: ConfigOverrides {
                database_url: self.database_url.clone(),
                ..ConfigOverrides::default()
            },
        }
    }
}

pub(crate) fn load_config(command: &str, args: &GlobalArgs) -> Result<AppConfig, CommandResult> {
    AppConfig::load(args.load_options()).map_err(|error| {
        CommandResult::failure(
            command,
            "config_validation",
            format!("configuration issue: {error}"),
            2,
        )
    })
}

/// Runs `task` on a current-thread runtime and renders its outcome.
pub(crate) fn execute<F>(command: &str, task: F) -> CommandResult
where
    F: Future<Output = Result<CommandResult, Failure>>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                command,
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    match runtime.block_on(task) {
        Ok(result) => result,
        Err(failure) => CommandResult::from_failure(command, failure),
    }
}

pub(crate) async fn open_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = connect_with_config(&config.database)
        .await
        .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
    migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
    Ok(pool)
}

/// A migrated pool and a workflow wired to the SQL repositories.
pub(crate) struct Session {
    pub pool: DbPool,
    pub workflow: ApprovalWorkflow,
}

impl Session {
    pub(crate) async fn open(config: &AppConfig) -> Result<Self, Failure> {
        let pool = open_pool(config).await?;

        let approvals = Arc::new(SqlApprovalRepository::new(pool.clone()));
        let notifier = NotificationFanout::new(
            Arc::new(SqlContactDirectory::new(pool.clone())),
            Arc::new(SqlEmailOutbox::new(pool.clone())),
            Arc::new(BroadcastPublisher::new(config.notifications.realtime_buffer)),
            config.notification_settings(),
        );
        let ports = WorkflowPorts {
            approvals: approvals.clone(),
            queries: approvals,
            dispatch_queue: Arc::new(SqlDispatchQueueRepository::new(pool.clone())),
            entities: Arc::new(SqlEntityRepository::new(pool.clone())),
            catalog: Arc::new(SqlCatalogRepository::new(pool.clone())),
            notifier,
            audit: Arc::new(TracingAuditSink),
        };
        let workflow = ApprovalWorkflow::new(ports, config.workflow_settings());

        Ok(Self { pool, workflow })
    }

    pub(crate) async fn close(self) {
        self.pool.close().await;
    }
}
