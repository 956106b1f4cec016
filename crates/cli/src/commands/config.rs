use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tollgate_core::config::AppConfig;
use toml::Value;

use super::GlobalArgs;

pub fn run(args: &GlobalArgs) -> String {
    let config = match AppConfig::load(args.load_options()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path(args.config_path.as_deref());
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let sources = SourceLookup {
        args,
        config_file_doc: config_file_doc.as_ref(),
        config_file_path: config_file_path.as_deref(),
    };

    let mut lines =
        vec!["effective config (source precedence: flag > env > file > default):".to_string()];
    for (key, value, env_keys) in effective_values(&config) {
        lines.push(render_line(key, &value, sources.field_source(key, env_keys)));
    }

    lines.join("\n")
}

type ConfigField = (&'static str, String, &'static [&'static str]);

fn effective_values(config: &AppConfig) -> Vec<ConfigField> {
    let database = &config.database;
    let workflow = &config.workflow;
    let dispatch = &config.dispatch;
    let notifications = &config.notifications;
    let logging = &config.logging;

    vec![
        field("database.url", database.url.clone(), &["TOLLGATE_DATABASE_URL"]),
        field(
            "database.max_connections",
            database.max_connections.to_string(),
            &["TOLLGATE_DATABASE_MAX_CONNECTIONS"],
        ),
        field(
            "database.timeout_secs",
            database.timeout_secs.to_string(),
            &["TOLLGATE_DATABASE_TIMEOUT_SECS"],
        ),
        field(
            "workflow.high_above",
            workflow.high_above.to_string(),
            &["TOLLGATE_WORKFLOW_HIGH_ABOVE"],
        ),
        field(
            "workflow.medium_above",
            workflow.medium_above.to_string(),
            &["TOLLGATE_WORKFLOW_MEDIUM_ABOVE"],
        ),
        field(
            "workflow.approval_threshold",
            workflow.approval_threshold.to_string(),
            &["TOLLGATE_WORKFLOW_APPROVAL_THRESHOLD"],
        ),
        field(
            "dispatch.max_retries",
            dispatch.max_retries.to_string(),
            &["TOLLGATE_DISPATCH_MAX_RETRIES"],
        ),
        field(
            "dispatch.retry_base_delay_secs",
            dispatch.retry_base_delay_secs.to_string(),
            &["TOLLGATE_DISPATCH_RETRY_BASE_DELAY_SECS"],
        ),
        field(
            "dispatch.retry_backoff_multiplier",
            dispatch.retry_backoff_multiplier.to_string(),
            &[],
        ),
        field(
            "dispatch.stale_after_secs",
            dispatch.stale_after_secs.to_string(),
            &["TOLLGATE_DISPATCH_STALE_AFTER_SECS"],
        ),
        field(
            "dispatch.batch_size",
            dispatch.batch_size.to_string(),
            &["TOLLGATE_DISPATCH_BATCH_SIZE"],
        ),
        field(
            "notifications.observers_channel",
            notifications.observers_channel.clone(),
            &["TOLLGATE_NOTIFICATIONS_OBSERVERS_CHANNEL"],
        ),
        field("notifications.realtime_buffer", notifications.realtime_buffer.to_string(), &[]),
        field(
            "notifications.sender_address",
            notifications.sender_address.clone(),
            &["TOLLGATE_NOTIFICATIONS_SENDER_ADDRESS"],
        ),
        field(
            "logging.level",
            logging.level.clone(),
            &["TOLLGATE_LOGGING_LEVEL", "TOLLGATE_LOG_LEVEL"],
        ),
        field(
            "logging.format",
            format!("{:?}", logging.format),
            &["TOLLGATE_LOGGING_FORMAT", "TOLLGATE_LOG_FORMAT"],
        ),
    ]
}

fn field(key: &'static str, value: String, env_keys: &'static [&'static str]) -> ConfigField {
    (key, value, env_keys)
}

struct SourceLookup<'a> {
    args: &'a GlobalArgs,
    config_file_doc: Option<&'a Value>,
    config_file_path: Option<&'a Path>,
}

impl SourceLookup<'_> {
    fn field_source(&self, key_path: &str, env_keys: &[&str]) -> String {
        if key_path == "database.url" && self.args.database_url.is_some() {
            return "flag (--database-url)".to_string();
        }

        if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
            return format!("env ({env_key})");
        }

        if let Some(doc) = self.config_file_doc {
            if contains_path(doc, key_path) {
                let file_path = self
                    .config_file_path
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "config file".to_string());
                return format!("file ({file_path})");
            }
        }

        "default".to_string()
    }
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    let root = PathBuf::from("tollgate.toml");
    if root.exists() {
        return Some(root);
    }

    let nested = PathBuf::from("config/tollgate.toml");
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
