//! Coordinator configuration, loaded from environment variables with defaults.

use std::{env, time::Duration};

use core_2pc::retry::RetryPolicy;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use thiserror::Error;
use tokio_postgres::NoTls;

use crate::coordinator::CoordinatorOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a number of milliseconds, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("unknown store kind {0:?}, expected `memory` or `postgres`")]
    UnknownStore(String),

    #[error("failed to create postgres pool: {0}")]
    Pool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct PostgresSettings {
    pub host: String,
    pub user: String,
    pub dbname: String,
    pub password: Option<String>,
}

impl PostgresSettings {
    pub fn create_pool(&self) -> Result<Pool, ConfigError> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.user = Some(self.user.clone());
        cfg.dbname = Some(self.dbname.clone());
        cfg.password = self.password.clone();
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| ConfigError::Pool(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind: String,
    pub store: StoreKind,
    pub postgres: PostgresSettings,
    pub default_timeout: Duration,
    pub sweep_interval: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub phase_two_wait: Duration,
}

fn millis(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

fn string(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

impl CoordinatorConfig {
    /// Read `TC_*` variables. Unset variables fall back to their defaults;
    /// malformed ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let store = match string("TC_STORE", "memory").to_ascii_lowercase().as_str() {
            "memory" => StoreKind::Memory,
            "postgres" => StoreKind::Postgres,
            other => return Err(ConfigError::UnknownStore(other.to_string())),
        };

        Ok(Self {
            bind: string("TC_BIND", "127.0.0.1:8091"),
            store,
            postgres: PostgresSettings {
                host: string("TC_PG_HOST", "localhost"),
                user: string("TC_PG_USER", "root"),
                dbname: string("TC_PG_DBNAME", "coordinator"),
                password: env::var("TC_PG_PASSWORD").ok(),
            },
            default_timeout: millis("TC_DEFAULT_TIMEOUT_MS", 60_000)?,
            sweep_interval: millis("TC_SWEEP_INTERVAL_MS", 1_000)?,
            retry_initial: millis("TC_RETRY_INITIAL_MS", 100)?,
            retry_max: millis("TC_RETRY_MAX_MS", 10_000)?,
            phase_two_wait: millis("TC_PHASE_TWO_WAIT_MS", 5_000)?,
        })
    }

    pub fn options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            default_timeout: self.default_timeout,
            retry: RetryPolicy::new(self.retry_initial, self.retry_max),
            phase_two_wait: self.phase_two_wait,
            sweep_interval: self.sweep_interval,
        }
    }
}
