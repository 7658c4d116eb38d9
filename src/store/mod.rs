//! Lock store primitives.
//!
//! A lock is nothing but the presence of a key. Acquisition is an atomic
//! set-if-absent, release an unconditional delete. Implementations must make
//! `set_if_absent` atomic across every process sharing the store; the lock
//! guard adds no coordination of its own.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::key::LockKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default upper bound on key length, in bytes.
pub const DEFAULT_MAX_KEY_LEN: usize = 1024;

/// A lock as seen by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: LockKey,
    pub acquired_at: DateTime<Utc>,
}

/// Shared key-value store holding lock records.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` if it is absent.
    /// Returns `Ok(true)` if this call created it, `Ok(false)` if it was already present.
    async fn set_if_absent(&self, key: &LockKey) -> Result<bool>;

    /// Remove `key`. Succeeds if the key is already absent.
    async fn delete(&self, key: &LockKey) -> Result<()>;

    /// Look up one lock record.
    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>>;

    /// List lock records, oldest first, optionally filtered by key prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<LockRecord>>;

    /// Longest key this store accepts.
    fn max_key_len(&self) -> usize {
        DEFAULT_MAX_KEY_LEN
    }
}
