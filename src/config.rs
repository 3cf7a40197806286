use anyhow::{Context, Result};
use std::env;

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HOST: &str = "0.0.0.0";

// Sliding-window admission control defaults. The window is fixed at one
// second; a key that overflows it sits in the penalty box for the timeout
// period.
const DEFAULT_REQUESTS_PER_SECOND: usize = 20;
const DEFAULT_TIMEOUT_PERIOD_SECS: u64 = 30;

/// Maximum HTTP request body size. Key bundles and encrypted initial
/// messages are small; anything larger is hostile.
pub const MAX_REQUEST_BODY_SIZE: usize = 2 * 1024 * 1024; // 2 MB

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Requests allowed per key within the 1-second sliding window
    pub requests_per_second: usize,
    /// Seconds an offending key stays in the penalty box
    pub timeout_period_secs: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Postgres connection string; when unset the relay runs on the
    /// in-memory store (single instance, state lost on restart)
    pub database_url: Option<String>,
    pub rust_log: String,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load configuration from environment variables with sane defaults
    pub fn from_env() -> Result<Self> {
        let port = match env::var("PORT") {
            Ok(raw) => raw.parse::<u16>().context("PORT must be a valid port number")?,
            Err(_) => DEFAULT_PORT,
        };

        let requests_per_second = match env::var("RATE_LIMIT_PER_SECOND") {
            Ok(raw) => raw
                .parse::<usize>()
                .context("RATE_LIMIT_PER_SECOND must be a positive integer")?,
            Err(_) => DEFAULT_REQUESTS_PER_SECOND,
        };

        let timeout_period_secs = match env::var("RATE_LIMIT_TIMEOUT_SECS") {
            Ok(raw) => raw
                .parse::<u64>()
                .context("RATE_LIMIT_TIMEOUT_SECS must be a positive integer")?,
            Err(_) => DEFAULT_TIMEOUT_PERIOD_SECS,
        };

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port,
            database_url: env::var("DATABASE_URL").ok(),
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            rate_limit: RateLimitConfig {
                requests_per_second,
                timeout_period_secs,
            },
        })
    }
}
