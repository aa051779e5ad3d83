use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub generation: GenerationConfig,
    pub delivery: DeliveryConfig,
    pub secrets: SecretsConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    /// Visibility/lease timeout granted on receive.
    pub lease_secs: u64,
    /// Heartbeat tick; must be shorter than the lease.
    pub heartbeat_interval_secs: u64,
    /// Extension granted per successful heartbeat.
    pub heartbeat_extension_secs: u64,
    /// Redeliveries before the transport dead-letters passively.
    pub max_receive_count: u32,
    pub worker_slots: usize,
}

#[derive(Clone, Debug)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub poll_ceiling_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Clone, Debug)]
pub struct SecretsConfig {
    pub cache_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
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

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub worker_slots: Option<usize>,
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
                url: "sqlite://courier.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            queue: QueueConfig {
                poll_interval_ms: 500,
                lease_secs: 60,
                heartbeat_interval_secs: 20,
                heartbeat_extension_secs: 60,
                max_receive_count: 5,
                worker_slots: 4,
            },
            generation: GenerationConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: None,
                poll_initial_ms: 1_000,
                poll_max_ms: 5_000,
                poll_ceiling_secs: 600,
                request_timeout_secs: 30,
                max_retries: 3,
            },
            delivery: DeliveryConfig {
                base_url: "https://graph.facebook.com/v19.0".to_string(),
                request_timeout_secs: 15,
                max_retries: 3,
            },
            secrets: SecretsConfig { cache_ttl_secs: 300 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
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
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("courier.toml"));
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

        if let Some(queue) = patch.queue {
            if let Some(poll_interval_ms) = queue.poll_interval_ms {
                self.queue.poll_interval_ms = poll_interval_ms;
            }
            if let Some(lease_secs) = queue.lease_secs {
                self.queue.lease_secs = lease_secs;
            }
            if let Some(heartbeat_interval_secs) = queue.heartbeat_interval_secs {
                self.queue.heartbeat_interval_secs = heartbeat_interval_secs;
            }
            if let Some(heartbeat_extension_secs) = queue.heartbeat_extension_secs {
                self.queue.heartbeat_extension_secs = heartbeat_extension_secs;
            }
            if let Some(max_receive_count) = queue.max_receive_count {
                self.queue.max_receive_count = max_receive_count;
            }
            if let Some(worker_slots) = queue.worker_slots {
                self.queue.worker_slots = worker_slots;
            }
        }

        if let Some(generation) = patch.generation {
            if let Some(base_url) = generation.base_url {
                self.generation.base_url = base_url;
            }
            if let Some(api_key_value) = generation.api_key {
                self.generation.api_key = Some(api_key_value.into());
            }
            if let Some(poll_initial_ms) = generation.poll_initial_ms {
                self.generation.poll_initial_ms = poll_initial_ms;
            }
            if let Some(poll_max_ms) = generation.poll_max_ms {
                self.generation.poll_max_ms = poll_max_ms;
            }
            if let Some(poll_ceiling_secs) = generation.poll_ceiling_secs {
                self.generation.poll_ceiling_secs = poll_ceiling_secs;
            }
            if let Some(request_timeout_secs) = generation.request_timeout_secs {
                self.generation.request_timeout_secs = request_timeout_secs;
            }
            if let Some(max_retries) = generation.max_retries {
                self.generation.max_retries = max_retries;
            }
        }

        if let Some(delivery) = patch.delivery {
            if let Some(base_url) = delivery.base_url {
                self.delivery.base_url = base_url;
            }
            if let Some(request_timeout_secs) = delivery.request_timeout_secs {
                self.delivery.request_timeout_secs = request_timeout_secs;
            }
            if let Some(max_retries) = delivery.max_retries {
                self.delivery.max_retries = max_retries;
            }
        }

        if let Some(secrets) = patch.secrets {
            if let Some(cache_ttl_secs) = secrets.cache_ttl_secs {
                self.secrets.cache_ttl_secs = cache_ttl_secs;
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
        if let Some(value) = read_env("COURIER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("COURIER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("COURIER_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("COURIER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("COURIER_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("COURIER_QUEUE_POLL_INTERVAL_MS") {
            self.queue.poll_interval_ms = parse_u64("COURIER_QUEUE_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("COURIER_QUEUE_LEASE_SECS") {
            self.queue.lease_secs = parse_u64("COURIER_QUEUE_LEASE_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_QUEUE_HEARTBEAT_INTERVAL_SECS") {
            self.queue.heartbeat_interval_secs =
                parse_u64("COURIER_QUEUE_HEARTBEAT_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_QUEUE_HEARTBEAT_EXTENSION_SECS") {
            self.queue.heartbeat_extension_secs =
                parse_u64("COURIER_QUEUE_HEARTBEAT_EXTENSION_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_QUEUE_MAX_RECEIVE_COUNT") {
            self.queue.max_receive_count = parse_u32("COURIER_QUEUE_MAX_RECEIVE_COUNT", &value)?;
        }
        if let Some(value) = read_env("COURIER_QUEUE_WORKER_SLOTS") {
            self.queue.worker_slots = parse_usize("COURIER_QUEUE_WORKER_SLOTS", &value)?;
        }

        if let Some(value) = read_env("COURIER_GENERATION_BASE_URL") {
            self.generation.base_url = value;
        }
        if let Some(value) = read_env("COURIER_GENERATION_API_KEY") {
            self.generation.api_key = Some(value.into());
        }
        if let Some(value) = read_env("COURIER_GENERATION_POLL_INITIAL_MS") {
            self.generation.poll_initial_ms =
                parse_u64("COURIER_GENERATION_POLL_INITIAL_MS", &value)?;
        }
        if let Some(value) = read_env("COURIER_GENERATION_POLL_MAX_MS") {
            self.generation.poll_max_ms = parse_u64("COURIER_GENERATION_POLL_MAX_MS", &value)?;
        }
        if let Some(value) = read_env("COURIER_GENERATION_POLL_CEILING_SECS") {
            self.generation.poll_ceiling_secs =
                parse_u64("COURIER_GENERATION_POLL_CEILING_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_GENERATION_REQUEST_TIMEOUT_SECS") {
            self.generation.request_timeout_secs =
                parse_u64("COURIER_GENERATION_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_GENERATION_MAX_RETRIES") {
            self.generation.max_retries = parse_u32("COURIER_GENERATION_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("COURIER_DELIVERY_BASE_URL") {
            self.delivery.base_url = value;
        }
        if let Some(value) = read_env("COURIER_DELIVERY_REQUEST_TIMEOUT_SECS") {
            self.delivery.request_timeout_secs =
                parse_u64("COURIER_DELIVERY_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("COURIER_DELIVERY_MAX_RETRIES") {
            self.delivery.max_retries = parse_u32("COURIER_DELIVERY_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("COURIER_SECRETS_CACHE_TTL_SECS") {
            self.secrets.cache_ttl_secs = parse_u64("COURIER_SECRETS_CACHE_TTL_SECS", &value)?;
        }

        let log_level = read_env("COURIER_LOGGING_LEVEL").or_else(|| read_env("COURIER_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("COURIER_LOGGING_FORMAT").or_else(|| read_env("COURIER_LOG_FORMAT"));
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
        if let Some(worker_slots) = overrides.worker_slots {
            self.queue.worker_slots = worker_slots;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_queue(&self.queue)?;
        validate_generation(&self.generation)?;
        validate_delivery(&self.delivery)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("courier.toml"), PathBuf::from("config/courier.toml")]
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

fn validate_queue(queue: &QueueConfig) -> Result<(), ConfigError> {
    if queue.worker_slots == 0 {
        return Err(ConfigError::Validation(
            "queue.worker_slots must be greater than zero".to_string(),
        ));
    }

    if queue.lease_secs == 0 {
        return Err(ConfigError::Validation("queue.lease_secs must be greater than zero".to_string()));
    }

    if queue.heartbeat_interval_secs == 0 || queue.heartbeat_interval_secs >= queue.lease_secs {
        return Err(ConfigError::Validation(
            "queue.heartbeat_interval_secs must be non-zero and shorter than queue.lease_secs"
                .to_string(),
        ));
    }

    if queue.heartbeat_extension_secs == 0 {
        return Err(ConfigError::Validation(
            "queue.heartbeat_extension_secs must be greater than zero".to_string(),
        ));
    }

    if queue.max_receive_count == 0 {
        return Err(ConfigError::Validation(
            "queue.max_receive_count must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_generation(generation: &GenerationConfig) -> Result<(), ConfigError> {
    if generation.poll_initial_ms == 0 || generation.poll_initial_ms > generation.poll_max_ms {
        return Err(ConfigError::Validation(
            "generation.poll_initial_ms must be non-zero and at most generation.poll_max_ms"
                .to_string(),
        ));
    }

    if generation.poll_ceiling_secs == 0 {
        return Err(ConfigError::Validation(
            "generation.poll_ceiling_secs must be greater than zero".to_string(),
        ));
    }

    if generation.request_timeout_secs == 0 || generation.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "generation.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_delivery(delivery: &DeliveryConfig) -> Result<(), ConfigError> {
    if delivery.request_timeout_secs == 0 || delivery.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "delivery.request_timeout_secs must be in range 1..=300".to_string(),
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

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    queue: Option<QueuePatch>,
    generation: Option<GenerationPatch>,
    delivery: Option<DeliveryPatch>,
    secrets: Option<SecretsPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct QueuePatch {
    poll_interval_ms: Option<u64>,
    lease_secs: Option<u64>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_extension_secs: Option<u64>,
    max_receive_count: Option<u32>,
    worker_slots: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerationPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    poll_initial_ms: Option<u64>,
    poll_max_ms: Option<u64>,
    poll_ceiling_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DeliveryPatch {
    base_url: Option<String>,
    request_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct SecretsPatch {
    cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
