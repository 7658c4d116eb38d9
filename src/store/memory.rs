use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{LockRecord, LockStore};
use crate::error::{Error, Result};
use crate::key::LockKey;

/// In-process lock store backed by a `Mutex<HashMap>`.
///
/// Clones share the same map, so one `MemoryStore` handed to several guards
/// (or tasks) behaves like one shared store. Only coordinates within a
/// single process.
#[derive(Clone, Default)]
pub struct MemoryStore {
    locks: Arc<Mutex<HashMap<LockKey, DateTime<Utc>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` is currently held.
    pub fn contains(&self, key: &LockKey) -> Result<bool> {
        Ok(self.map()?.contains_key(key))
    }

    /// Number of keys currently held.
    pub fn len(&self) -> Result<usize> {
        Ok(self.map()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn map(&self) -> Result<MutexGuard<'_, HashMap<LockKey, DateTime<Utc>>>> {
        self.locks
            .lock()
            .map_err(|_| Error::Other("memory lock store poisoned".to_string()))
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn set_if_absent(&self, key: &LockKey) -> Result<bool> {
        let mut locks = self.map()?;
        if locks.contains_key(key) {
            return Ok(false);
        }
        locks.insert(key.clone(), Utc::now());
        Ok(true)
    }

    async fn delete(&self, key: &LockKey) -> Result<()> {
        self.map()?.remove(key);
        Ok(())
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        Ok(self.map()?.get(key).map(|acquired_at| LockRecord {
            key: key.clone(),
            acquired_at: *acquired_at,
        }))
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<LockRecord>> {
        let mut records: Vec<LockRecord> = self
            .map()?
            .iter()
            .filter(|(key, _)| prefix.is_none_or(|p| key.as_str().starts_with(p)))
            .map(|(key, acquired_at)| LockRecord {
                key: key.clone(),
                acquired_at: *acquired_at,
            })
            .collect();
        records.sort_by(|a, b| {
            a.acquired_at
                .cmp(&b.acquired_at)
                .then_with(|| a.key.as_str().cmp(b.key.as_str()))
        });
        Ok(records)
    }
}
