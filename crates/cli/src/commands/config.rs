use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use gradplan_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// Config keys reported by `gradplan config`, with the environment variable that overrides each.
const FIELDS: &[(&str, &str)] = &[
    ("database.url", "GRADPLAN_DATABASE_URL"),
    ("database.max_connections", "GRADPLAN_DATABASE_MAX_CONNECTIONS"),
    ("database.timeout_secs", "GRADPLAN_DATABASE_TIMEOUT_SECS"),
    ("llm.provider", "GRADPLAN_LLM_PROVIDER"),
    ("llm.model", "GRADPLAN_LLM_MODEL"),
    ("llm.base_url", "GRADPLAN_LLM_BASE_URL"),
    ("llm.api_key", "GRADPLAN_LLM_API_KEY"),
    ("llm.timeout_secs", "GRADPLAN_LLM_TIMEOUT_SECS"),
    ("server.bind_address", "GRADPLAN_SERVER_BIND_ADDRESS"),
    ("server.port", "GRADPLAN_SERVER_PORT"),
    ("server.graceful_shutdown_secs", "GRADPLAN_SERVER_GRACEFUL_SHUTDOWN_SECS"),
    ("worker.batch_limit", "GRADPLAN_WORKER_BATCH_LIMIT"),
    ("worker.max_batch_limit", "GRADPLAN_WORKER_MAX_BATCH_LIMIT"),
    ("worker.concurrency", "GRADPLAN_WORKER_CONCURRENCY"),
    ("worker.claim_timeout_secs", "GRADPLAN_WORKER_CLAIM_TIMEOUT_SECS"),
    ("worker.max_reasoning_attempts", "GRADPLAN_WORKER_MAX_REASONING_ATTEMPTS"),
    ("worker.sweep_interval_secs", "GRADPLAN_WORKER_SWEEP_INTERVAL_SECS"),
    ("worker.internal_token", "GRADPLAN_WORKER_INTERNAL_TOKEN"),
    ("logging.level", "GRADPLAN_LOGGING_LEVEL"),
    ("logging.format", "GRADPLAN_LOGGING_FORMAT"),
];

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_key) in FIELDS {
        let source =
            field_source(key_path, env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key_path, &display_value(&config, key_path), source));
    }

    lines.join("\n")
}

fn display_value(config: &AppConfig, key_path: &str) -> String {
    match key_path {
        "database.url" => config.database.url.clone(),
        "database.max_connections" => config.database.max_connections.to_string(),
        "database.timeout_secs" => config.database.timeout_secs.to_string(),
        "llm.provider" => format!("{:?}", config.llm.provider),
        "llm.model" => config.llm.model.clone(),
        "llm.base_url" => config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        "llm.api_key" => redacted(config.llm.api_key.is_some()),
        "llm.timeout_secs" => config.llm.timeout_secs.to_string(),
        "server.bind_address" => config.server.bind_address.clone(),
        "server.port" => config.server.port.to_string(),
        "server.graceful_shutdown_secs" => config.server.graceful_shutdown_secs.to_string(),
        "worker.batch_limit" => config.worker.batch_limit.to_string(),
        "worker.max_batch_limit" => config.worker.max_batch_limit.to_string(),
        "worker.concurrency" => config.worker.concurrency.to_string(),
        "worker.claim_timeout_secs" => config.worker.claim_timeout_secs.to_string(),
        "worker.max_reasoning_attempts" => config.worker.max_reasoning_attempts.to_string(),
        "worker.sweep_interval_secs" => config.worker.sweep_interval_secs.to_string(),
        "worker.internal_token" => redacted(config.worker.internal_token.is_some()),
        "logging.level" => config.logging.level.clone(),
        "logging.format" => format!("{:?}", config.logging.format),
        _ => "<unknown>".to_string(),
    }
}

fn redacted(present: bool) -> String {
    if present { "<redacted>" } else { "<unset>" }.to_string()
}

fn detect_config_path() -> Option<PathBuf> {
    ["gradplan.toml", "config/gradplan.toml"].into_iter().map(PathBuf::from).find(|p| p.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if config_file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file_path = config_file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    key_path.split('.').try_fold(root, |current, key| current.get(key)).is_some()
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}
