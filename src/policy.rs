//! Lock policies: how a job's lock key is derived and what happens when an
//! invocation finds its key already held.
//!
//! A policy is handed to a [`LockGuard`](crate::guard::LockGuard) at
//! construction. Both methods have defaults, so a policy only overrides what
//! it needs:
//!
//! ```no_run
//! use workq_lock::{JobArgs, LockKey, LockPolicy};
//!
//! /// One network-graph rebuild at a time, whatever the repo.
//! struct NetworkGraph;
//!
//! #[async_trait::async_trait]
//! impl LockPolicy for NetworkGraph {
//!     fn lock_key(&self, _identity: &str, _args: &JobArgs) -> LockKey {
//!         LockKey::new("network-graph")
//!     }
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::Result;
use crate::key::{JobArgs, LockKey};
use crate::model::JobMessage;

/// Key derivation and contention handling for one lock domain.
#[async_trait]
pub trait LockPolicy: Send + Sync {
    /// Derive the lock key for an invocation. Must be deterministic.
    fn lock_key(&self, identity: &str, args: &JobArgs) -> LockKey {
        LockKey::derive(identity, args)
    }

    /// Called instead of the job body when the key is already held.
    ///
    /// Nothing is returned to the guard. An override that retries the job
    /// synchronously through the same guard is responsible for bounding
    /// that retry.
    async fn job_locked(&self, identity: &str, args: &JobArgs) {
        let _ = (identity, args);
    }
}

/// Per-arguments key, duplicates dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl LockPolicy for DefaultPolicy {}

/// One running instance per job identity, regardless of arguments.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassLock;

impl LockPolicy for ClassLock {
    fn lock_key(&self, identity: &str, _args: &JobArgs) -> LockKey {
        LockKey::for_class(identity)
    }
}

/// Every invocation contends on one fixed key.
#[derive(Debug, Clone)]
pub struct FixedKey(pub LockKey);

impl FixedKey {
    pub fn new(key: impl Into<LockKey>) -> Self {
        Self(key.into())
    }
}

impl LockPolicy for FixedKey {
    fn lock_key(&self, _identity: &str, _args: &JobArgs) -> LockKey {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Requeue
// ---------------------------------------------------------------------------

/// Smallest delay [`Requeue`] submits with.
pub const MIN_REQUEUE_DELAY_SECONDS: i32 = 1;

/// Somewhere a suppressed invocation can be submitted again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &JobMessage, delay_seconds: i32) -> Result<i64>;
}

/// Contention handler that puts the suppressed invocation back on a queue.
///
/// Keys are derived with the wrapped policy, so `Requeue::new(queue, 30)`
/// locks per arguments and `Requeue::new(queue, 30).keyed_by(ClassLock)`
/// per job identity.
///
/// The delay is at least [`MIN_REQUEUE_DELAY_SECONDS`]. A zero delay onto
/// the queue a worker drains would be read straight back, contend again and
/// spin until the holder finishes.
pub struct Requeue {
    queue: Arc<dyn JobQueue>,
    delay_seconds: i32,
    keys: Arc<dyn LockPolicy>,
}

impl Requeue {
    pub fn new(queue: Arc<dyn JobQueue>, delay_seconds: i32) -> Self {
        if delay_seconds < MIN_REQUEUE_DELAY_SECONDS {
            warn!(
                delay_seconds,
                "requeue delay raised to {MIN_REQUEUE_DELAY_SECONDS}s"
            );
        }
        Self {
            queue,
            delay_seconds: delay_seconds.max(MIN_REQUEUE_DELAY_SECONDS),
            keys: Arc::new(DefaultPolicy),
        }
    }

    /// Derive keys with another policy's `lock_key`.
    pub fn keyed_by(mut self, policy: impl LockPolicy + 'static) -> Self {
        self.keys = Arc::new(policy);
        self
    }
}

#[async_trait]
impl LockPolicy for Requeue {
    fn lock_key(&self, identity: &str, args: &JobArgs) -> LockKey {
        self.keys.lock_key(identity, args)
    }

    async fn job_locked(&self, identity: &str, args: &JobArgs) {
        let message = JobMessage::new(identity, args.clone());
        match self.queue.enqueue(&message, self.delay_seconds).await {
            Ok(msg_id) => {
                info!(job = identity, %args, msg_id, delay = self.delay_seconds, "locked job requeued");
            }
            Err(e) => {
                warn!(job = identity, %args, "failed to requeue locked job: {e}");
            }
        }
    }
}
