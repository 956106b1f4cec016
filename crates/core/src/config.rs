use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatchPolicy;
use crate::notify::{NotificationSettings, DEFAULT_OBSERVERS_CHANNEL, DEFAULT_REALTIME_CAPACITY};
use crate::planner::PriorityThresholds;
use crate::service::WorkflowSettings;

#[derive(Clone, Debug, Serialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub workflow: WorkflowConfig,
    pub dispatch: DispatchConfig,
    pub notifications: NotificationsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkflowConfig {
    /// Amounts strictly above this are HIGH priority.
    pub high_above: Decimal,
    /// Amounts strictly above this (and not HIGH) are MEDIUM priority.
    pub medium_above: Decimal,
    pub approval_threshold: Decimal,
}

#[derive(Clone, Debug, Serialize)]
pub struct DispatchConfig {
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_backoff_multiplier: u32,
    pub stale_after_secs: u64,
    pub batch_size: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct NotificationsConfig {
    pub observers_channel: String,
    pub realtime_buffer: usize,
    pub sender_address: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub approval_threshold: Option<Decimal>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        let priority = PriorityThresholds::default();
        let workflow = WorkflowSettings::default();
        let dispatch = DispatchPolicy::default();
        let notifications = NotificationSettings::default();

        Self {
            database: DatabaseConfig {
                url: "sqlite://tollgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            workflow: WorkflowConfig {
                high_above: priority.high_above,
                medium_above: priority.medium_above,
                approval_threshold: workflow.approval_threshold,
            },
            dispatch: DispatchConfig {
                max_retries: dispatch.max_retries,
                retry_base_delay_secs: dispatch.retry_base_delay_secs.unsigned_abs(),
                retry_backoff_multiplier: dispatch.retry_backoff_multiplier,
                stale_after_secs: dispatch.stale_after_secs.unsigned_abs(),
                batch_size: dispatch.batch_size,
            },
            notifications: NotificationsConfig {
                observers_channel: DEFAULT_OBSERVERS_CHANNEL.to_string(),
                realtime_buffer: DEFAULT_REALTIME_CAPACITY,
                sender_address: notifications.sender_address,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("tollgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            priority: PriorityThresholds {
                high_above: self.workflow.high_above,
                medium_above: self.workflow.medium_above,
            },
            approval_threshold: self.workflow.approval_threshold,
            dispatch: DispatchPolicy {
                max_retries: self.dispatch.max_retries,
                retry_base_delay_secs: saturating_secs(self.dispatch.retry_base_delay_secs),
                retry_backoff_multiplier: self.dispatch.retry_backoff_multiplier,
                stale_after_secs: saturating_secs(self.dispatch.stale_after_secs),
                batch_size: self.dispatch.batch_size,
            },
        }
    }

    pub fn notification_settings(&self) -> NotificationSettings {
        NotificationSettings {
            observers_channel: self.notifications.observers_channel.clone(),
            sender_address: self.notifications.sender_address.clone(),
        }
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(workflow) = patch.workflow {
            if let Some(high_above) = workflow.high_above {
                self.workflow.high_above = high_above;
            }
            if let Some(medium_above) = workflow.medium_above {
                self.workflow.medium_above = medium_above;
            }
            if let Some(approval_threshold) = workflow.approval_threshold {
                self.workflow.approval_threshold = approval_threshold;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(max_retries) = dispatch.max_retries {
                self.dispatch.max_retries = max_retries;
            }
            if let Some(delay) = dispatch.retry_base_delay_secs {
                self.dispatch.retry_base_delay_secs = delay;
            }
            if let Some(multiplier) = dispatch.retry_backoff_multiplier {
                self.dispatch.retry_backoff_multiplier = multiplier;
            }
            if let Some(stale_after_secs) = dispatch.stale_after_secs {
                self.dispatch.stale_after_secs = stale_after_secs;
            }
            if let Some(batch_size) = dispatch.batch_size {
                self.dispatch.batch_size = batch_size;
            }
        }

        if let Some(notifications) = patch.notifications {
            if let Some(observers_channel) = notifications.observers_channel {
                self.notifications.observers_channel = observers_channel;
            }
            if let Some(realtime_buffer) = notifications.realtime_buffer {
                self.notifications.realtime_buffer = realtime_buffer;
            }
            if let Some(sender_address) = notifications.sender_address {
                self.notifications.sender_address = sender_address;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TOLLGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("TOLLGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("TOLLGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("TOLLGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_WORKFLOW_HIGH_ABOVE") {
            self.workflow.high_above = parse_decimal("TOLLGATE_WORKFLOW_HIGH_ABOVE", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_WORKFLOW_MEDIUM_ABOVE") {
            self.workflow.medium_above = parse_decimal("TOLLGATE_WORKFLOW_MEDIUM_ABOVE", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_WORKFLOW_APPROVAL_THRESHOLD") {
            self.workflow.approval_threshold =
                parse_decimal("TOLLGATE_WORKFLOW_APPROVAL_THRESHOLD", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_DISPATCH_MAX_RETRIES") {
            self.dispatch.max_retries = parse_u32("TOLLGATE_DISPATCH_MAX_RETRIES", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_DISPATCH_RETRY_BASE_DELAY_SECS") {
            self.dispatch.retry_base_delay_secs =
                parse_u64("TOLLGATE_DISPATCH_RETRY_BASE_DELAY_SECS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_DISPATCH_STALE_AFTER_SECS") {
            self.dispatch.stale_after_secs =
                parse_u64("TOLLGATE_DISPATCH_STALE_AFTER_SECS", &value)?;
        }
        if let Some(value) = read_env("TOLLGATE_DISPATCH_BATCH_SIZE") {
            self.dispatch.batch_size = parse_u32("TOLLGATE_DISPATCH_BATCH_SIZE", &value)?;
        }

        if let Some(value) = read_env("TOLLGATE_NOTIFICATIONS_OBSERVERS_CHANNEL") {
            self.notifications.observers_channel = value;
        }
        if let Some(value) = read_env("TOLLGATE_NOTIFICATIONS_SENDER_ADDRESS") {
            self.notifications.sender_address = value;
        }

        let log_level =
            read_env("TOLLGATE_LOGGING_LEVEL").or_else(|| read_env("TOLLGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TOLLGATE_LOGGING_FORMAT").or_else(|| read_env("TOLLGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(approval_threshold) = overrides.approval_threshold {
            self.workflow.approval_threshold = approval_threshold;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_workflow(&self.workflow)?;
        validate_dispatch(&self.dispatch)?;
        validate_notifications(&self.notifications)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn saturating_secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tollgate.toml"), PathBuf::from("config/tollgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_workflow(workflow: &WorkflowConfig) -> Result<(), ConfigError> {
    if workflow.medium_above.is_sign_negative() || workflow.high_above.is_sign_negative() {
        return Err(ConfigError::Validation(
            "workflow priority thresholds must not be negative".to_string(),
        ));
    }

    if workflow.high_above < workflow.medium_above {
        return Err(ConfigError::Validation(
            "workflow.high_above must be greater than or equal to workflow.medium_above"
                .to_string(),
        ));
    }

    if workflow.approval_threshold.is_sign_negative() {
        return Err(ConfigError::Validation(
            "workflow.approval_threshold must not be negative".to_string(),
        ));
    }

    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    if dispatch.retry_backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "dispatch.retry_backoff_multiplier must be greater than zero".to_string(),
        ));
    }

    if dispatch.batch_size == 0 {
        return Err(ConfigError::Validation(
            "dispatch.batch_size must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_notifications(notifications: &NotificationsConfig) -> Result<(), ConfigError> {
    if notifications.observers_channel.trim().is_empty() {
        return Err(ConfigError::Validation(
            "notifications.observers_channel must not be empty".to_string(),
        ));
    }

    if notifications.realtime_buffer == 0 {
        return Err(ConfigError::Validation(
            "notifications.realtime_buffer must be greater than zero".to_string(),
        ));
    }

    if !notifications.sender_address.contains('@') {
        return Err(ConfigError::Validation(
            "notifications.sender_address must be an email address".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_decimal(key: &str, value: &str) -> Result<Decimal, ConfigError> {
    value.trim().parse::<Decimal>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    workflow: Option<WorkflowPatch>,
    dispatch: Option<DispatchPatch>,
    notifications: Option<NotificationsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowPatch {
    high_above: Option<Decimal>,
    medium_above: Option<Decimal>,
    approval_threshold: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    max_retries: Option<u32>,
    retry_base_delay_secs: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
    stale_after_secs: Option<u64>,
    batch_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationsPatch {
    observers_channel: Option<String>,
    realtime_buffer: Option<usize>,
    sender_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use rust_decimal::Decimal;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    fn missing_file() -> Result<(TempDir, std::path::PathBuf), String> {
        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("absent.toml");
        Ok((dir, path))
    }

    #[test]
    fn defaults_are_valid_and_map_to_workflow_settings() -> Result<(), String> {
        let config = AppConfig::default();
        config.validate().map_err(|err| err.to_string())?;

        let settings = config.workflow_settings();
        ensure(
            settings.approval_threshold == Decimal::new(50_000, 0),
            "default approval threshold should be 50,000",
        )?;
        ensure(
            settings.priority.high_above == Decimal::new(200_000, 0),
            "default high priority boundary should be 200,000",
        )?;
        ensure(settings.dispatch.max_retries == 5, "default dispatch retries should be 5")?;
        ensure(
            config.notification_settings().observers_channel == "observers",
            "default observers channel should be `observers`",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_TOLLGATE_SENDER", "finance-approvals@example.com");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("tollgate.toml");
            fs::write(
                &path,
                r#"
[workflow]
approval_threshold = 75000

[notifications]
sender_address = "${TEST_TOLLGATE_SENDER}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.notifications.sender_address == "finance-approvals@example.com",
                "sender address should be interpolated from environment",
            )?;
            ensure(
                config.workflow.approval_threshold == Decimal::new(75_000, 0),
                "approval threshold should come from the file",
            )
        })();

        clear_vars(&["TEST_TOLLGATE_SENDER"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;
        clear_vars(&["TEST_TOLLGATE_UNSET_VAR"]);

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("tollgate.toml");
        fs::write(&path, "[database]\nurl = \"${TEST_TOLLGATE_UNSET_VAR}\"\n")
            .map_err(|err| err.to_string())?;

        match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() }) {
            Err(ConfigError::MissingEnvInterpolation { var }) => {
                ensure(var == "TEST_TOLLGATE_UNSET_VAR", "error should name the variable")
            }
            other => Err(format!("expected interpolation failure, got {other:?}")),
        }
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOLLGATE_LOG_LEVEL", "warn");
        env::set_var("TOLLGATE_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let (_dir, path) = missing_file()?;
            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )
        })();

        clear_vars(&["TOLLGATE_LOG_LEVEL", "TOLLGATE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOLLGATE_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("TOLLGATE_DISPATCH_MAX_RETRIES", "9");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("tollgate.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[dispatch]
max_retries = 3
batch_size = 10

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.dispatch.max_retries == 9, "env retries should win over the file")?;
            ensure(config.dispatch.batch_size == 10, "file batch size should win over defaults")
        })();

        clear_vars(&["TOLLGATE_DATABASE_URL", "TOLLGATE_DISPATCH_MAX_RETRIES"]);
        result
    }

    #[test]
    fn invalid_env_override_names_the_key() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TOLLGATE_WORKFLOW_APPROVAL_THRESHOLD", "lots");

        let result = (|| -> Result<(), String> {
            let (_dir, path) = missing_file()?;
            match AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
            {
                Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                    key == "TOLLGATE_WORKFLOW_APPROVAL_THRESHOLD",
                    "error should name the offending variable",
                ),
                other => Err(format!("expected invalid override, got {other:?}")),
            }
        })();

        clear_vars(&["TOLLGATE_WORKFLOW_APPROVAL_THRESHOLD"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("tollgate.toml");
        fs::write(&path, "[workflow]\nhigh_above = 10000\nmedium_above = 20000\n")
            .map_err(|err| err.to_string())?;

        let error = match AppConfig::load(LoadOptions {
            config_path: Some(path),
            ..LoadOptions::default()
        }) {
            Ok(_) => return Err("expected validation failure but config load succeeded".into()),
            Err(error) => error,
        };
        let has_message = matches!(
            error,
            ConfigError::Validation(ref message) if message.contains("workflow.high_above")
        );
        ensure(has_message, "validation failure should mention workflow.high_above")
    }

    #[test]
    fn required_file_must_exist() -> Result<(), String> {
        let (_dir, path) = missing_file()?;
        let result = AppConfig::load(LoadOptions {
            config_path: Some(path),
            require_file: true,
            ..LoadOptions::default()
        });
        ensure(
            matches!(result, Err(ConfigError::MissingConfigFile(_))),
            "missing required file should fail",
        )
    }
}
