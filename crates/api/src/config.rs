//! Application configuration

use std::env;
use std::time::Duration;

/// Token secret value shipped in sample configs. Startup refuses it.
const DEFAULT_TOKEN_SECRET: &str = "livedesk-change-me-livedesk-change-me";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,

    // Redis mirror (empty disables mirroring)
    pub redis_url: String,

    // Authentication
    pub token_secret: String,
    pub token_ttl_hours: i64,

    // Liveness
    pub heartbeat_ttl: Duration,

    // Reconcilers
    pub heartbeat_sweep_period: Duration,
    pub waiting_drain_period: Duration,
    pub timeout_sweep_period: Duration,
    pub timeout_threshold_mins: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,

            redis_url: env::var("REDIS_URL").unwrap_or_default(),

            token_secret: {
                let secret = env::var("TOKEN_SECRET")
                    .map_err(|_| ConfigError::Missing("TOKEN_SECRET"))?;
                if secret == DEFAULT_TOKEN_SECRET {
                    return Err(ConfigError::DefaultSecret(
                        "TOKEN_SECRET is still set to the sample value",
                    ));
                }
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "TOKEN_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            token_ttl_hours: parse_var("TOKEN_TTL_HOURS", 24),

            heartbeat_ttl: Duration::from_secs(parse_var("HEARTBEAT_TTL_SECS", 60)),

            heartbeat_sweep_period: Duration::from_secs(parse_var("HEARTBEAT_SWEEP_SECS", 30)),
            waiting_drain_period: Duration::from_secs(parse_var("WAITING_DRAIN_SECS", 60)),
            timeout_sweep_period: Duration::from_secs(parse_var("TIMEOUT_SWEEP_SECS", 60)),
            timeout_threshold_mins: parse_var("TIMEOUT_THRESHOLD_MINS", 2),
        })
    }
}

fn parse_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Insecure configuration: {0}")]
    DefaultSecret(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}
