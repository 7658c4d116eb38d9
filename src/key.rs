//! Lock keys and the job argument sequences they are derived from.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every key the built-in derivers produce.
pub const KEY_PREFIX: &str = "lock:";

// ---------------------------------------------------------------------------
// Job arguments
// ---------------------------------------------------------------------------

/// Ordered arguments of one job invocation.
///
/// Displays as a compact JSON array (`["repo42",7]`). Two argument lists
/// with the same rendering are the same lock identity, whatever their
/// origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobArgs(pub Vec<serde_json::Value>);

impl JobArgs {
    pub fn new(values: Vec<serde_json::Value>) -> Self {
        Self(values)
    }

    /// Parse a JSON array, e.g. from the command line.
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn values(&self) -> &[serde_json::Value] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: Into<serde_json::Value>> FromIterator<T> for JobArgs {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl fmt::Display for JobArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str("]")
    }
}

// ---------------------------------------------------------------------------
// Lock key
// ---------------------------------------------------------------------------

/// Store key naming the contention point for a job invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Default derivation: `lock:<identity>-<args>`.
    pub fn derive(identity: &str, args: &JobArgs) -> Self {
        Self(format!("{KEY_PREFIX}{identity}-{args}"))
    }

    /// One key per job identity, ignoring arguments.
    pub fn for_class(identity: &str) -> Self {
        Self(format!("{KEY_PREFIX}{identity}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject keys the store cannot hold.
    pub fn validate(&self, max_len: usize) -> Result<()> {
        if self.0.is_empty() {
            return Err(Error::InvalidKey("lock key is empty".to_string()));
        }
        if self.0.len() > max_len {
            return Err(Error::InvalidKey(format!(
                "lock key is {} bytes, store limit is {max_len}",
                self.0.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for LockKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}
