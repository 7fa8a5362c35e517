//! Application configuration

use std::env;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

/// Accepted `PURGE_RETENTION_DAYS`, ten years at most
pub const PURGE_RETENTION_DAYS_RANGE: RangeInclusive<i64> = 1..=3650;

/// Which Message Store implementation backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            _ => Err(ConfigError::Invalid {
                var: "STORE_BACKEND",
                reason: "expected `postgres` or `memory`",
            }),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_origins: Vec<String>,
    pub json_logs: bool,

    // Database
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,

    // Chat
    pub purge_retention_days: i64,
    pub purge_interval_secs: u64,
    pub session_queue_capacity: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let store_backend = match env::var("STORE_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => StoreBackend::Postgres,
        };

        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::WeakSecret(
                "JWT_SECRET must be at least 32 characters",
            ));
        }

        let session_queue_capacity = parse_var("SESSION_QUEUE_CAPACITY", 256usize)?;
        if session_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                var: "SESSION_QUEUE_CAPACITY",
                reason: "must be greater than zero",
            });
        }

        let purge_interval_secs = parse_var("PURGE_INTERVAL_SECS", 86_400u64)?;
        if purge_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "PURGE_INTERVAL_SECS",
                reason: "must be greater than zero",
            });
        }

        let purge_retention_days = parse_var("PURGE_RETENTION_DAYS", 30i64)?;
        if !PURGE_RETENTION_DAYS_RANGE.contains(&purge_retention_days) {
            return Err(ConfigError::Invalid {
                var: "PURGE_RETENTION_DAYS",
                reason: "must be between 1 and 3650",
            });
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            json_logs: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),

            // Database
            store_backend,
            database_url,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 20u32)?,

            // Authentication
            jwt_secret,

            // Chat
            purge_retention_days,
            purge_interval_secs,
            session_queue_capacity,
        })
    }

    pub fn purge_retention(&self) -> time::Duration {
        let days = self.purge_retention_days.clamp(
            *PURGE_RETENTION_DAYS_RANGE.start(),
            *PURGE_RETENTION_DAYS_RANGE.end(),
        );
        time::Duration::days(days)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

fn parse_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            reason: "not a valid number",
        }),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {var}: {reason}")]
    Invalid {
        var: &'static str,
        reason: &'static str,
    },
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
