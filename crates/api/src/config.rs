//! Server configuration from environment variables

use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Central billing database
    pub database_url: String,
    /// Server hosting tenant databases; the database name is replaced per tenant
    pub tenant_database_url: String,
    pub bind_address: SocketAddr,
    /// Bearer token for `/admin` routes; admin routes are hidden without it
    pub admin_api_token: Option<String>,
    pub tenant_pool_max_connections: u32,
    /// Bound on reaching any store before it is reported unavailable
    pub store_connect_timeout: Duration,
    /// Tenant pools unused this long are closed
    pub tenant_pool_idle: Duration,
    pub run_migrations: bool,
}

fn optional(key: &'static str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = optional("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let tenant_database_url =
            optional("TENANT_DATABASE_URL").unwrap_or_else(|| database_url.clone());

        let bind_address = optional("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
        let bind_address = bind_address.parse().map_err(|_| ConfigError::Invalid {
            key: "BIND_ADDRESS",
            value: bind_address.clone(),
        })?;

        let tenant_pool_max_connections = parse_or("TENANT_POOL_MAX_CONNECTIONS", 5u32)?;
        if tenant_pool_max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "TENANT_POOL_MAX_CONNECTIONS",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url,
            tenant_database_url,
            bind_address,
            admin_api_token: optional("ADMIN_API_TOKEN"),
            tenant_pool_max_connections,
            store_connect_timeout: Duration::from_secs(parse_or("STORE_CONNECT_TIMEOUT_SECS", 5u64)?),
            tenant_pool_idle: Duration::from_secs(parse_or("TENANT_POOL_IDLE_SECS", 900u64)?),
            run_migrations: parse_or("RUN_MIGRATIONS", false)?,
        })
    }
}
