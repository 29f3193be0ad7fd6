//! Server configuration.
//!
//! Read from environment variables. A `.env` file, if present, is loaded
//! by `main` before this runs.

use std::time::Duration;

use thiserror::Error;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum database connections in the pool.
    pub database_max_connections: u32,
    /// Address to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
    /// Snapshot an aggregate every this many events (0 disables).
    pub snapshot_every: i64,
    /// How long a saga step waits for its confirming event.
    pub saga_step_timeout: Duration,
    /// Fallback polling interval of the projector.
    pub projection_poll_interval: Duration,
    /// Whether to run document migrations at startup.
    pub run_migrations: bool,
    /// OTLP collector endpoint. Traces are only exported when set.
    pub otlp_endpoint: Option<String>,
}

/// Configuration error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),

    /// A variable is set but cannot be parsed.
    #[error("invalid value for environment variable {name}: {value:?}")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `DATABASE_URL` is missing or any variable
    /// fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's
    /// value or `None` if unset.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `DATABASE_URL` is missing, any variable
    /// fails to parse, or a duration is zero.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::MissingEnv("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: parse_or(&lookup, "PORT", 3000)?,
            snapshot_every: parse_or(&lookup, "SNAPSHOT_EVERY", 50)?,
            saga_step_timeout: millis_or(&lookup, "SAGA_STEP_TIMEOUT_MS", 5000)?,
            projection_poll_interval: millis_or(&lookup, "PROJECTION_POLL_INTERVAL_MS", 1000)?,
            run_migrations: parse_or(&lookup, "RUN_MIGRATIONS", true)?,
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|v| !v.trim().is_empty()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// A positive duration in milliseconds. Zero is rejected.
fn millis_or<F>(lookup: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse_or(lookup, name, default)? {
        0 => Err(ConfigError::InvalidValue {
            name,
            value: "0".to_owned(),
        }),
        millis => Ok(Duration::from_millis(millis)),
    }
}
