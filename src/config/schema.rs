use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use hex::encode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteJournalMode;

use crate::policy::TablePolicyConfig;
use crate::query::PageLimits;
use crate::repository::PoolSettings;

pub const ENV_PREFIX: &str = "PETREL";
pub const ENV_SEPARATOR: &str = "__";

#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct PetrelConfig {
    pub database: Database,
    #[serde(default)]
    pub frontend: Frontend,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub realtime: Realtime,
    /// Row-level security, keyed by table name. Tables not listed here are
    /// closed.
    #[serde(default)]
    pub policies: HashMap<String, TablePolicyConfig>,
    #[serde(default)]
    pub misc: Misc,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Database {
    #[cfg(feature = "catalog-postgres")]
    Postgres(Postgres),
    Sqlite(Sqlite),
}

impl Database {
    pub fn dsn(&self) -> &str {
        match self {
            #[cfg(feature = "catalog-postgres")]
            Database::Postgres(Postgres { dsn, .. }) => dsn,
            Database::Sqlite(Sqlite { dsn, .. }) => dsn,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        let (max_connections, acquire_timeout_ms) = match self {
            #[cfg(feature = "catalog-postgres")]
            Database::Postgres(p) => (p.max_connections, p.acquire_timeout_ms),
            Database::Sqlite(s) => (s.max_connections, s.acquire_timeout_ms),
        };
        PoolSettings {
            max_connections,
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Postgres {
    pub dsn: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct Sqlite {
    pub dsn: String,
    #[serde(default)]
    pub journal_mode: JournalMode,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    Delete,
    Truncate,
    Persist,
    Memory,
    #[default]
    Wal,
    Off,
}

impl From<JournalMode> for SqliteJournalMode {
    fn from(mode: JournalMode) -> Self {
        match mode {
            JournalMode::Delete => SqliteJournalMode::Delete,
            JournalMode::Truncate => SqliteJournalMode::Truncate,
            JournalMode::Persist => SqliteJournalMode::Persist,
            JournalMode::Memory => SqliteJournalMode::Memory,
            JournalMode::Wal => SqliteJournalMode::Wal,
            JournalMode::Off => SqliteJournalMode::Off,
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_max_connections() -> u32 {
    PoolSettings::default().max_connections
}

fn default_acquire_timeout_ms() -> u64 {
    PoolSettings::default().acquire_timeout.as_millis() as u64
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct Frontend {
    pub http: Option<HttpFrontend>,
}

impl Default for Frontend {
    fn default() -> Self {
        Self {
            http: Some(HttpFrontend::default()),
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct HttpFrontend {
    pub bind_host: String,
    pub bind_port: u16,
    pub request_timeout_ms: u64,
    pub default_page_size: u64,
    pub max_page_size: u64,
}

impl Default for HttpFrontend {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8090,
            request_timeout_ms: 30_000,
            default_page_size: PageLimits::default().default_per_page,
            max_page_size: PageLimits::default().max_per_page,
        }
    }
}

impl HttpFrontend {
    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_per_page: self.default_page_size,
            max_per_page: self.max_page_size,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Deserialize, Debug, PartialEq, Clone, Default)]
pub struct AuthConfig {
    /// Let requests without a token through as the anonymous principal
    #[serde(default)]
    pub allow_anonymous: bool,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Deserialize, Debug, PartialEq, Clone)]
pub struct TokenConfig {
    pub sha256_hash: String,
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub claims: HashMap<String, JsonValue>,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Realtime {
    pub queue_capacity: usize,
    pub sweep_interval_ms: u64,
    pub keep_alive_ms: u64,
}

impl Default for Realtime {
    fn default() -> Self {
        Self {
            queue_capacity: crate::realtime::DEFAULT_QUEUE_CAPACITY,
            sweep_interval_ms: 30_000,
            keep_alive_ms: 15_000,
        }
    }
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone, Default)]
#[serde(default)]
pub struct Misc {
    pub metrics: Option<Metrics>,
}

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Metrics {
    pub host: String,
    pub port: u16,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9090,
        }
    }
}

pub fn str_to_hex_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    encode(hasher.finalize())
}

pub fn validate_config(config: PetrelConfig) -> Result<PetrelConfig, ConfigError> {
    if let Some(http) = &config.frontend.http {
        if http.default_page_size == 0 || http.default_page_size > http.max_page_size {
            return Err(ConfigError::Message(format!(
                "default_page_size must be between 1 and max_page_size ({}), got {}",
                http.max_page_size, http.default_page_size
            )));
        }
    }

    if config.realtime.queue_capacity == 0 {
        return Err(ConfigError::Message(
            "realtime.queue_capacity must be greater than 0".to_string(),
        ));
    }

    if config.database.pool_settings().max_connections == 0 {
        return Err(ConfigError::Message(
            "database.max_connections must be greater than 0".to_string(),
        ));
    }

    for token in &config.auth.tokens {
        if token.sha256_hash.len() != 64 || hex::decode(&token.sha256_hash).is_err() {
            return Err(ConfigError::Message(format!(
                "Token for {:?} must be a hex-encoded SHA-256 hash",
                token.id
            )));
        }
    }

    Ok(config)
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR)
}

pub fn load_config(path: &Path) -> Result<PetrelConfig, ConfigError> {
    let path = path
        .to_str()
        .ok_or_else(|| ConfigError::Message(format!("Invalid config path {path:?}")))?;
    let config = Config::builder()
        .add_source(File::with_name(path))
        .add_source(environment());

    config.build()?.try_deserialize().and_then(validate_config)
}

// Load a config from a string (to test our structs are defined correctly)
pub fn load_config_from_string(
    config_str: &str,
    skip_validation: bool,
    env: Option<HashMap<String, String>>,
) -> Result<PetrelConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::from_str(config_str, FileFormat::Toml))
        .add_source(environment().source(env));

    if skip_validation {
        config.build()?.try_deserialize()
    } else {
        config.build()?.try_deserialize().and_then(validate_config)
    }
}
