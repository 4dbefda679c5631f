//! Element configuration: the role comes from the command line, everything
//! else from `ELEMENT_*` and related environment variables.

use std::{env, fmt, str::FromStr, time::Duration};

use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use thiserror::Error;
use tokio_postgres::NoTls;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: element <storage|account|order|business>")]
    MissingRole,

    #[error("unknown role {0:?}")]
    UnknownRole(String),

    #[error("{var} must be a number of milliseconds, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("unknown store kind {0:?}, expected `memory` or `postgres`")]
    UnknownStore(String),

    #[error("failed to create postgres pool: {0}")]
    Pool(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Storage,
    Account,
    Order,
    Business,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Account => "account",
            Self::Order => "order",
            Self::Business => "business",
        }
    }

    const fn default_port(&self) -> u16 {
        match self {
            Self::Business => 8090,
            Self::Storage => 8092,
            Self::Account => 8093,
            Self::Order => 8094,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "storage" => Ok(Self::Storage),
            "account" => Ok(Self::Account),
            "order" => Ok(Self::Order),
            "business" => Ok(Self::Business),
            other => Err(ConfigError::UnknownRole(other.to_string())),
        }
    }
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
pub struct ElementConfig {
    pub role: Role,
    pub bind: String,
    /// Base URL the coordinator calls back with decisions.
    pub endpoint: String,
    pub tc_url: String,
    pub store: StoreKind,
    pub postgres: PostgresSettings,
    pub storage_url: String,
    pub account_url: String,
    pub order_url: String,
    pub purchase_timeout: Duration,
}

fn string(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn local_url(role: Role) -> String {
    format!("http://127.0.0.1:{}", role.default_port())
}

impl ElementConfig {
    /// `args` are the process arguments, program name first.
    pub fn from_env(args: &[String]) -> Result<Self, ConfigError> {
        let role: Role = args.get(1).ok_or(ConfigError::MissingRole)?.parse()?;

        let store = match string("ELEMENT_STORE", "memory").to_ascii_lowercase().as_str() {
            "memory" => StoreKind::Memory,
            "postgres" => StoreKind::Postgres,
            other => return Err(ConfigError::UnknownStore(other.to_string())),
        };

        let purchase_timeout = match env::var("PURCHASE_TIMEOUT_MS") {
            Ok(value) => value
                .trim()
                .parse()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "PURCHASE_TIMEOUT_MS",
                    value,
                })?,
            Err(_) => Duration::from_secs(30),
        };

        let bind = string("ELEMENT_BIND", &format!("127.0.0.1:{}", role.default_port()));
        Ok(Self {
            role,
            endpoint: string("ELEMENT_ENDPOINT", &format!("http://{bind}")),
            bind,
            tc_url: string("TC_URL", "http://127.0.0.1:8091"),
            store,
            postgres: PostgresSettings {
                host: string("ELEMENT_PG_HOST", "localhost"),
                user: string("ELEMENT_PG_USER", "root"),
                dbname: string("ELEMENT_PG_DBNAME", role.as_str()),
                password: env::var("ELEMENT_PG_PASSWORD").ok(),
            },
            storage_url: string("STORAGE_URL", &local_url(Role::Storage)),
            account_url: string("ACCOUNT_URL", &local_url(Role::Account)),
            order_url: string("ORDER_URL", &local_url(Role::Order)),
            purchase_timeout,
        })
    }
}
