//! Layered configuration: defaults, then `config.toml`, then `USER_STORE_*`
//! environment variables (nested keys split on `__`).

use std::path::Path;
use std::time::Duration;

use backon::ExponentialBuilder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::db::schema::SchemaSpec;
use crate::error::StoreError;

pub const ENV_PREFIX: &str = "USER_STORE_";
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub loglevel: String,
    pub backend: BackendKind,
    pub store: StoreCoordinates,
    pub retry: RetryConfig,
    pub postgres: PostgresOptions,
    /// Upper bound for a single connect attempt. None waits for the store.
    pub connect_timeout_ms: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: "info".to_string(),
            backend: BackendKind::Postgres,
            store: StoreCoordinates::default(),
            retry: RetryConfig::default(),
            postgres: PostgresOptions::default(),
            connect_timeout_ms: None,
        }
    }
}

impl Config {
    /// Load from `config.toml` in the working directory plus the environment.
    pub fn load() -> Result<Self, StoreError> {
        Self::load_from(CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let cfg: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        cfg.schema()?;
        Ok(cfg)
    }

    pub fn schema(&self) -> Result<SchemaSpec, StoreError> {
        SchemaSpec::new(self.store.db.clone(), self.store.table.clone())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Memory,
}

/// Where the backing store lives and which database/table hold the users.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreCoordinates {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub auth_key: Option<String>,
    pub db: String,
    pub table: String,
}

impl Default for StoreCoordinates {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            auth_key: None,
            db: "users".to_string(),
            table: "users".to_string(),
        }
    }
}

impl std::fmt::Debug for StoreCoordinates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCoordinates")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth_key", &self.auth_key.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("table", &self.table)
            .finish()
    }
}

/// Reconnect schedule. The defaults retry every second, forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub delay_ms: u64,
    /// None retries without limit.
    pub max_attempts: Option<usize>,
    /// Growth applied to the delay after each failed attempt; 1.0 keeps it fixed.
    pub factor: f32,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            max_attempts: None,
            factor: 1.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            delay_ms,
            max_attempts: None,
            factor: 1.0,
            max_delay_ms: delay_ms,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn policy(&self) -> ExponentialBuilder {
        let min = self.delay();
        let max = Duration::from_millis(self.max_delay_ms).max(min);
        ExponentialBuilder::default()
            .with_min_delay(min)
            .with_max_delay(max)
            .with_factor(self.factor.max(1.0))
            .with_max_times(self.max_attempts.unwrap_or(usize::MAX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresOptions {
    pub user: String,
    pub database: String,
    /// How often the live connection is pinged to detect silent loss.
    pub keepalive_interval_ms: u64,
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            database: "postgres".to_string(),
            keepalive_interval_ms: 5000,
        }
    }
}

impl PostgresOptions {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}
