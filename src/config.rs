//! Process configuration: every knob is read from an environment variable with
//! a documented default, mirroring the teacher's preference for
//! `Config::default()` plus a handful of overrides over a config-file loader.

use nutype::nutype;

use crate::database::DatabasePath;
use crate::domain_types::{ConnectionPoolSize, ScriptFuelBudget, ScriptTimeoutMs, ServerId};

/// TCP port the management HTTP surface binds to.
#[nutype(validate(greater = 0), derive(Debug, Clone, Copy, PartialEq, Eq))]
pub struct ServerPort(u16);

impl Default for ServerPort {
    fn default() -> Self {
        Self::try_new(8080).expect("8080 is a valid port")
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the axum listener binds to.
    pub port: ServerPort,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: ServerPort::default() }
    }
}

/// Top-level process configuration, assembled at startup from environment
/// variables. There is no config-file layer: every field has a documented
/// default and an `CONDUIT_*` override.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP surface configuration.
    pub server: ServerConfig,
    /// Path to the SQLite database file.
    pub database_path: DatabasePath,
    /// SQLite connection pool size.
    pub pool_size: ConnectionPoolSize,
    /// Identity this engine instance stamps on messages it produces.
    pub server_id: ServerId,
    /// Default wall-clock timeout for scripts that don't override it.
    pub default_script_timeout_ms: ScriptTimeoutMs,
    /// Default fuel budget for scripts that don't override it.
    pub default_script_fuel_budget: ScriptFuelBudget,
}

/// Error loading configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable was present but failed validation.
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar {
        /// Name of the offending environment variable.
        var: &'static str,
        /// Reason the value was rejected.
        reason: String,
    },
}

impl AppConfig {
    /// Loads configuration from the environment, falling back to defaults for
    /// anything unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnvVar`] if a set environment variable
    /// fails its domain-type validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = env_or("CONDUIT_PORT", ServerPort::default(), |s| {
            s.parse::<u16>().ok().and_then(|v| ServerPort::try_new(v).ok())
        })?;

        let database_path = match std::env::var("CONDUIT_DATABASE_PATH") {
            Ok(value) => DatabasePath::new(&value).map_err(|e| ConfigError::InvalidEnvVar {
                var: "CONDUIT_DATABASE_PATH",
                reason: e.to_string(),
            })?,
            Err(_) => DatabasePath::new("conduit.db").expect("default database path is valid"),
        };

        let pool_size = env_or("CONDUIT_POOL_SIZE", ConnectionPoolSize::default(), |s| {
            s.parse::<usize>().ok().and_then(|v| ConnectionPoolSize::try_new(v).ok())
        })?;

        let server_id = match std::env::var("CONDUIT_SERVER_ID") {
            Ok(value) => ServerId::try_new(value)
                .map_err(|e| ConfigError::InvalidEnvVar { var: "CONDUIT_SERVER_ID", reason: e.to_string() })?,
            Err(_) => ServerId::try_new("conduit-1").expect("default server id is valid"),
        };

        let default_script_timeout_ms = env_or("CONDUIT_SCRIPT_TIMEOUT_MS", ScriptTimeoutMs::default(), |s| {
            s.parse::<u64>().ok().and_then(|v| ScriptTimeoutMs::try_new(v).ok())
        })?;

        let default_script_fuel_budget = env_or("CONDUIT_SCRIPT_FUEL_BUDGET", ScriptFuelBudget::default(), |s| {
            s.parse::<u64>().ok().and_then(|v| ScriptFuelBudget::try_new(v).ok())
        })?;

        Ok(Self {
            server: ServerConfig { port },
            database_path,
            pool_size,
            server_id,
            default_script_timeout_ms,
            default_script_fuel_budget,
        })
    }
}

fn env_or<T>(var: &'static str, default: T, parse: impl Fn(&str) -> Option<T>) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => parse(&raw)
            .ok_or_else(|| ConfigError::InvalidEnvVar { var, reason: format!("could not parse {raw:?}") }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_port_default_is_8080() {
        assert_eq!(ServerPort::default().into_inner(), 8080);
    }

    #[test]
    fn env_or_falls_back_to_default_when_unset() {
        let result = env_or::<u16>("CONDUIT_TEST_NONEXISTENT_VAR", 42, |s| s.parse().ok());
        assert_eq!(result.unwrap(), 42);
    }
}
