use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::generation_engine::GenerationEngineConfig;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Jobs claimed per worker cycle when the caller gives no limit.
    pub batch_limit: u32,
    /// Upper bound applied to any caller-supplied limit.
    pub max_batch_limit: u32,
    /// Drivers allowed to run at once in the process.
    pub concurrency: u32,
    pub claim_timeout_secs: u64,
    pub max_reasoning_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub max_tool_failures_per_step: u32,
    pub max_turns_per_step: u32,
    pub tool_timeout_secs: u64,
    /// Interval for the in-process sweep; zero leaves sweeping to an external scheduler.
    pub sweep_interval_secs: u64,
    pub internal_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
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
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub server_port: Option<u16>,
    pub worker_batch_limit: Option<u32>,
    pub worker_internal_token: Option<String>,
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
        Self {
            database: DatabaseConfig {
                url: "sqlite://gradplan.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            worker: WorkerConfig {
                batch_limit: 3,
                max_batch_limit: 10,
                concurrency: 4,
                claim_timeout_secs: 300,
                max_reasoning_attempts: 3,
                retry_base_delay_ms: 250,
                retry_max_delay_ms: 5_000,
                max_tool_failures_per_step: 3,
                max_turns_per_step: 24,
                tool_timeout_secs: 15,
                sweep_interval_secs: 0,
                internal_token: None,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
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

impl WorkerConfig {
    pub fn engine_config(&self) -> GenerationEngineConfig {
        GenerationEngineConfig {
            claim_timeout_seconds: i64::try_from(self.claim_timeout_secs).unwrap_or(i64::MAX),
            max_reasoning_attempts: self.max_reasoning_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms,
            max_tool_failures_per_step: self.max_tool_failures_per_step,
            max_turns_per_step: self.max_turns_per_step,
            ..GenerationEngineConfig::default()
        }
    }

    /// Longest a single driver iteration can legitimately run without touching the job:
    /// every reasoning attempt timing out, the capped backoff between them, then one tool call.
    pub fn worst_case_iteration_secs(&self, reasoning_timeout_secs: u64) -> u64 {
        let attempts = u64::from(self.max_reasoning_attempts);
        let backoff_ms = self.retry_max_delay_ms.saturating_mul(attempts.saturating_sub(1));
        reasoning_timeout_secs
            .saturating_mul(attempts)
            .saturating_add(backoff_ms.div_ceil(1_000))
            .saturating_add(self.tool_timeout_secs)
    }

    /// Applies the configured default and cap to a caller-supplied batch limit.
    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.batch_limit).clamp(1, self.max_batch_limit)
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("gradplan.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
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

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(worker) = patch.worker {
            let target = &mut self.worker;
            if let Some(value) = worker.batch_limit {
                target.batch_limit = value;
            }
            if let Some(value) = worker.max_batch_limit {
                target.max_batch_limit = value;
            }
            if let Some(value) = worker.concurrency {
                target.concurrency = value;
            }
            if let Some(value) = worker.claim_timeout_secs {
                target.claim_timeout_secs = value;
            }
            if let Some(value) = worker.max_reasoning_attempts {
                target.max_reasoning_attempts = value;
            }
            if let Some(value) = worker.retry_base_delay_ms {
                target.retry_base_delay_ms = value;
            }
            if let Some(value) = worker.retry_max_delay_ms {
                target.retry_max_delay_ms = value;
            }
            if let Some(value) = worker.max_tool_failures_per_step {
                target.max_tool_failures_per_step = value;
            }
            if let Some(value) = worker.max_turns_per_step {
                target.max_turns_per_step = value;
            }
            if let Some(value) = worker.tool_timeout_secs {
                target.tool_timeout_secs = value;
            }
            if let Some(value) = worker.sweep_interval_secs {
                target.sweep_interval_secs = value;
            }
            if let Some(value) = worker.internal_token {
                target.internal_token = Some(secret_value(value));
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
        if let Some(value) = read_env("GRADPLAN_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("GRADPLAN_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("GRADPLAN_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("GRADPLAN_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("GRADPLAN_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("GRADPLAN_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("GRADPLAN_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("GRADPLAN_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("GRADPLAN_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("GRADPLAN_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("GRADPLAN_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("GRADPLAN_SERVER_PORT") {
            self.server.port = parse_u16("GRADPLAN_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("GRADPLAN_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("GRADPLAN_WORKER_BATCH_LIMIT") {
            self.worker.batch_limit = parse_u32("GRADPLAN_WORKER_BATCH_LIMIT", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_WORKER_MAX_BATCH_LIMIT") {
            self.worker.max_batch_limit = parse_u32("GRADPLAN_WORKER_MAX_BATCH_LIMIT", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_u32("GRADPLAN_WORKER_CONCURRENCY", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_WORKER_CLAIM_TIMEOUT_SECS") {
            self.worker.claim_timeout_secs =
                parse_u64("GRADPLAN_WORKER_CLAIM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_WORKER_MAX_REASONING_ATTEMPTS") {
            self.worker.max_reasoning_attempts =
                parse_u32("GRADPLAN_WORKER_MAX_REASONING_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_WORKER_SWEEP_INTERVAL_SECS") {
            self.worker.sweep_interval_secs =
                parse_u64("GRADPLAN_WORKER_SWEEP_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("GRADPLAN_WORKER_INTERNAL_TOKEN") {
            self.worker.internal_token = Some(secret_value(value));
        }

        let log_level =
            read_env("GRADPLAN_LOGGING_LEVEL").or_else(|| read_env("GRADPLAN_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("GRADPLAN_LOGGING_FORMAT").or_else(|| read_env("GRADPLAN_LOG_FORMAT"));
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
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(batch_limit) = overrides.worker_batch_limit {
            self.worker.batch_limit = batch_limit;
        }
        if let Some(token) = overrides.worker_internal_token {
            self.worker.internal_token = Some(secret_value(token));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_worker(&self.worker)?;
        validate_claim_timeout(&self.worker, &self.llm)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("gradplan.toml"), PathBuf::from("config/gradplan.toml")]
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

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_worker(worker: &WorkerConfig) -> Result<(), ConfigError> {
    if worker.max_batch_limit == 0 {
        return Err(ConfigError::Validation(
            "worker.max_batch_limit must be greater than zero".to_string(),
        ));
    }
    if worker.batch_limit == 0 || worker.batch_limit > worker.max_batch_limit {
        return Err(ConfigError::Validation(
            "worker.batch_limit must be in range 1..=worker.max_batch_limit".to_string(),
        ));
    }
    if worker.concurrency == 0 {
        return Err(ConfigError::Validation(
            "worker.concurrency must be greater than zero".to_string(),
        ));
    }
    if worker.max_reasoning_attempts == 0 || worker.max_reasoning_attempts > 10 {
        return Err(ConfigError::Validation(
            "worker.max_reasoning_attempts must be in range 1..=10".to_string(),
        ));
    }
    if worker.retry_base_delay_ms > worker.retry_max_delay_ms {
        return Err(ConfigError::Validation(
            "worker.retry_base_delay_ms must not exceed worker.retry_max_delay_ms".to_string(),
        ));
    }
    if worker.max_turns_per_step == 0 {
        return Err(ConfigError::Validation(
            "worker.max_turns_per_step must be greater than zero".to_string(),
        ));
    }
    if worker.claim_timeout_secs == 0 || worker.tool_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "worker.claim_timeout_secs and worker.tool_timeout_secs must be greater than zero"
                .to_string(),
        ));
    }
    if let Some(token) = &worker.internal_token {
        if token.expose_secret().trim().len() < 16 {
            return Err(ConfigError::Validation(
                "worker.internal_token must be at least 16 characters".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_claim_timeout(worker: &WorkerConfig, llm: &LlmConfig) -> Result<(), ConfigError> {
    let worst_case = worker.worst_case_iteration_secs(llm.timeout_secs);
    if worker.claim_timeout_secs <= worst_case {
        return Err(ConfigError::Validation(format!(
            "worker.claim_timeout_secs must exceed {worst_case}s, the longest a driver can go \
             between heartbeats with the configured reasoning and tool timeouts"
        )));
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

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
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

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    worker: Option<WorkerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WorkerPatch {
    batch_limit: Option<u32>,
    max_batch_limit: Option<u32>,
    concurrency: Option<u32>,
    claim_timeout_secs: Option<u64>,
    max_reasoning_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_max_delay_ms: Option<u64>,
    max_tool_failures_per_step: Option<u32>,
    max_turns_per_step: Option<u32>,
    tool_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    internal_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
