//! Error types for workq-lock.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid lock key: {0}")]
    InvalidKey(String),

    #[error("lock store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("bad job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
