//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or malformed.
//! The database URL is wrapped in secrecy::SecretString to prevent log leaks.

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// pgmq queue the worker reads and `Requeue` writes.
    pub queue: String,
    /// Visibility timeout (seconds) for pgmq reads.
    pub visibility_timeout: i32,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            queue: std::env::var("WORKQ_QUEUE").unwrap_or_else(|_| "jobs".to_string()),
            visibility_timeout: parsed_var("WORKQ_VISIBILITY_TIMEOUT", 60)?,
            poll_interval: Duration::from_millis(parsed_var("WORKQ_POLL_INTERVAL_MS", 5000)?),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} has an invalid value: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
