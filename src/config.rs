//! Configuration module
//!
//! Loads configuration from environment variables.

use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database connections in pool
    pub database_max_connections: u32,

    /// Environment (development, production)
    pub environment: String,

    /// How long a reference claim stays alive before the sweeper may drop it
    pub claim_ttl_minutes: i64,

    /// How long an unbound claim must sit idle before a rival caller may take it over
    pub claim_takeover_seconds: i64,

    /// Upper bound on a single provider call before it is treated as indeterminate
    pub provider_timeout_seconds: u64,

    /// How often the reconciliation job wakes up
    pub reconcile_interval_seconds: u64,

    /// How many stuck transactions one reconciliation pass will touch
    pub reconcile_batch_size: i64,

    /// Age past which a still-indeterminate reservation is force-reversed
    pub force_reverse_after_minutes: i64,
}

impl WalletConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnv("DATABASE_URL"))?;

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("DATABASE_MAX_CONNECTIONS"))?;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let claim_ttl_minutes = env::var("CLAIM_TTL_MINUTES")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("CLAIM_TTL_MINUTES"))?;

        let claim_takeover_seconds = env::var("CLAIM_TAKEOVER_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("CLAIM_TAKEOVER_SECONDS"))?;

        let provider_timeout_seconds = env::var("PROVIDER_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("PROVIDER_TIMEOUT_SECONDS"))?;

        let reconcile_interval_seconds = env::var("RECONCILE_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("RECONCILE_INTERVAL_SECONDS"))?;

        let reconcile_batch_size = env::var("RECONCILE_BATCH_SIZE")
            .unwrap_or_else(|_| "50".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("RECONCILE_BATCH_SIZE"))?;

        let force_reverse_after_minutes = env::var("FORCE_REVERSE_AFTER_MINUTES")
            .unwrap_or_else(|_| "1440".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidValue("FORCE_REVERSE_AFTER_MINUTES"))?;

        Ok(Self {
            database_url,
            database_max_connections,
            environment,
            claim_ttl_minutes,
            claim_takeover_seconds,
            provider_timeout_seconds,
            reconcile_interval_seconds,
            reconcile_batch_size,
            force_reverse_after_minutes,
        })
    }

    /// Defaults suitable for tests and local drills, no database required
    pub fn for_tests() -> Self {
        Self {
            database_url: String::new(),
            database_max_connections: 5,
            environment: "test".to_string(),
            claim_ttl_minutes: 60,
            claim_takeover_seconds: 300,
            provider_timeout_seconds: 5,
            reconcile_interval_seconds: 1,
            reconcile_batch_size: 50,
            force_reverse_after_minutes: 1440,
        }
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn claim_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.claim_ttl_minutes)
    }

    pub fn claim_takeover(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_takeover_seconds)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }

    pub fn force_reverse_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.force_reverse_after_minutes)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
