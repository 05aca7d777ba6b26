use crate::server::ExecutionUnit;
use crate::session::MalformedBatchPolicy;
use crate::types::WireFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Prefix for environment overrides, e.g. `LOTTERY_SERVER__AGENCIES=5`.
pub const ENV_PREFIX: &str = "LOTTERY";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub lottery: LotteryConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub listen_backlog: u32,
    /// Number of agencies taking part; ids run from 1 to this value.
    pub agencies: u32,
    pub execution_unit: ExecutionUnit,
    pub malformed_batch_policy: MalformedBatchPolicy,
    pub winners_format: WireFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:12345".to_string(),
            listen_backlog: 5,
            agencies: 5,
            execution_unit: ExecutionUnit::default(),
            malformed_batch_policy: MalformedBatchPolicy::default(),
            winners_format: WireFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LotteryConfig {
    pub winning_number: u32,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            winning_number: 7574,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub db_path: PathBuf,
    pub sqlite_cache_size: i32,
    pub sqlite_busy_timeout: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            db_path: PathBuf::from("data/bets.db"),
            sqlite_cache_size: 10000,
            sqlite_busy_timeout: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// `LOTTERY_SERVER__AGENCIES` maps to `server.agencies`: one `_` after the
/// prefix, `__` between sections.
fn env_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl Config {
    /// Load defaults, then the TOML file at `path` if it exists, then
    /// `LOTTERY_*` environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        Self::load_layered(path, env_source())
    }

    fn load_layered(path: &str, env: config::Environment) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(env)
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.agencies == 0 {
            return Err(ConfigError::Invalid(
                "server.agencies must be at least 1".to_string(),
            ));
        }
        if self.server.listen_backlog == 0 {
            return Err(ConfigError::Invalid(
                "server.listen_backlog must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
