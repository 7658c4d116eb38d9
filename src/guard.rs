//! The lock guard: acquire, run the job body, release.
//!
//! ```text
//! Idle -> Attempting -> Holding -> Releasing -> Idle
//!                    \-> Contended (job_locked) -> Idle
//! ```
//!
//! Contention is not an error: the policy's `job_locked` runs and the caller
//! gets [`Performed::Locked`]. Store failures are never reported as
//! contention.
//!
//! Release is unconditional and untargeted: it deletes by key, with no
//! ownership token. A release that fails leaves the lock record in place
//! with no holder and nothing expires it; it is reported as
//! [`PerformError::Release`] (or logged, if the body also failed) and has to
//! be cleared by an operator (`workq-lock locks clear <key>`).
//!
//! A panicking body is caught, its lock released inline, and the panic
//! resumed. Only a cancelled invocation (its future dropped) releases from a
//! spawned task. If a release is itself cancelled after its delete reached
//! the store, that spawned task deletes the key a second time and can clear
//! a lock another invocation has taken in between.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use opentelemetry::KeyValue;
use thiserror::Error;
use tracing::{Instrument, debug, error, warn};

use crate::error::Error;
use crate::key::{JobArgs, LockKey};
use crate::policy::{DefaultPolicy, LockPolicy};
use crate::store::LockStore;
use crate::telemetry::lock::{record_outcome, start_lock_span};
use crate::telemetry::metrics;

/// What a guarded invocation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Performed<T> {
    /// The lock was acquired, the body ran and the lock was released.
    Ran(T),
    /// The key was already held; `job_locked` ran instead of the body.
    Locked,
}

impl<T> Performed<T> {
    pub fn is_locked(&self) -> bool {
        matches!(self, Performed::Locked)
    }
}

/// Why a guarded invocation failed.
#[derive(Debug, Error)]
pub enum PerformError<E> {
    /// The job body returned an error. The lock was released first.
    #[error("{0}")]
    Job(E),

    /// The store could not answer the acquire. The body did not run.
    #[error("failed to acquire lock {key}: {source}")]
    Acquire {
        key: LockKey,
        #[source]
        source: Error,
    },

    /// The body succeeded but the lock could not be deleted. The record is
    /// stuck until an operator clears it.
    #[error("job ran but lock {key} was not released: {source}")]
    Release {
        key: LockKey,
        #[source]
        source: Error,
    },

    /// The policy derived a key the store cannot hold.
    #[error(transparent)]
    InvalidKey(Error),
}

impl<E> PerformError<E> {
    /// The job body's own error, if that is what this is.
    pub fn into_job(self) -> Option<E> {
        match self {
            PerformError::Job(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the lock protocol itself (not the job) failed.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, PerformError::Job(_))
    }
}

/// Wraps job execution in a store-backed lock.
///
/// One guard is one lock domain: a store plus a policy. It keeps no state
/// between invocations and is cheap to clone.
#[derive(Clone)]
pub struct LockGuard {
    store: Arc<dyn LockStore>,
    policy: Arc<dyn LockPolicy>,
}

impl LockGuard {
    /// Guard with the default policy: per-arguments key, duplicates dropped.
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            policy: Arc::new(DefaultPolicy),
        }
    }

    pub fn with_policy(mut self, policy: impl LockPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// The key an invocation would contend on.
    pub fn lock_key(&self, identity: &str, args: &JobArgs) -> LockKey {
        self.policy.lock_key(identity, args)
    }

    /// Run `body` if the lock for (`identity`, `args`) can be taken,
    /// otherwise hand the invocation to the policy's `job_locked`.
    ///
    /// The body's value or error is returned as-is. The lock is released on
    /// every exit from the body. A panic is resumed after the release
    /// completes. If the returned future is dropped mid-body, the release runs
    /// from a spawned task on the current tokio runtime.
    pub async fn perform<T, E, F, Fut>(
        &self,
        identity: &str,
        args: &JobArgs,
        body: F,
    ) -> Result<Performed<T>, PerformError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = self.policy.lock_key(identity, args);
        key.validate(self.store.max_key_len())
            .map_err(PerformError::InvalidKey)?;

        let span = start_lock_span(identity, &key);
        async {
            let acquired = match self.store.set_if_absent(&key).await {
                Ok(acquired) => acquired,
                Err(source) => {
                    record_acquire(identity, "error");
                    record_outcome(&span, "error");
                    error!(%key, "lock acquire failed: {source}");
                    return Err(PerformError::Acquire { key, source });
                }
            };

            if !acquired {
                record_acquire(identity, "contended");
                record_outcome(&span, "locked");
                debug!(%key, "lock already held, calling job_locked");
                self.policy.job_locked(identity, args).await;
                return Ok(Performed::Locked);
            }

            record_acquire(identity, "acquired");
            debug!(%key, "lock acquired");
            let held = HeldLock::new(Arc::clone(&self.store), key.clone(), identity);

            let outcome = AssertUnwindSafe(async move { body().await })
                .catch_unwind()
                .await;
            let released = held.release().await;

            let result = match outcome {
                Ok(result) => result,
                Err(payload) => {
                    record_outcome(&span, "panicked");
                    match &released {
                        Ok(()) => warn!(%key, "job panicked, lock released"),
                        Err(source) => {
                            error!(%key, "job panicked and lock release failed, lock is stuck: {source}")
                        }
                    }
                    panic::resume_unwind(payload);
                }
            };

            match (result, released) {
                (Ok(value), Ok(())) => {
                    record_outcome(&span, "ran");
                    Ok(Performed::Ran(value))
                }
                (Ok(_), Err(source)) => {
                    record_outcome(&span, "stuck");
                    error!(%key, "job ran but lock release failed, lock is stuck: {source}");
                    Err(PerformError::Release { key, source })
                }
                (Err(e), Ok(())) => {
                    record_outcome(&span, "failed");
                    Err(PerformError::Job(e))
                }
                (Err(e), Err(source)) => {
                    record_outcome(&span, "failed");
                    error!(%key, "job failed and lock release failed, lock is stuck: {source}");
                    Err(PerformError::Job(e))
                }
            }
        }
        .instrument(span.clone())
        .await
    }
}

fn record_acquire(job: &str, result: &'static str) {
    metrics::lock_acquire().add(
        1,
        &[
            KeyValue::new("job", job.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

fn record_release(job: &str, result: &'static str) {
    metrics::lock_release().add(
        1,
        &[
            KeyValue::new("job", job.to_string()),
            KeyValue::new("result", result),
        ],
    );
}

// ---------------------------------------------------------------------------
// Held lock
// ---------------------------------------------------------------------------

/// An acquired lock. Deletes its key on [`release`](HeldLock::release), or
/// from a spawned task if the invocation is cancelled while it is held.
struct HeldLock {
    store: Arc<dyn LockStore>,
    /// `Some` until a delete has completed (successfully or not).
    key: Option<LockKey>,
    job: String,
    acquired_at: Instant,
}

impl HeldLock {
    fn new(store: Arc<dyn LockStore>, key: LockKey, job: &str) -> Self {
        Self {
            store,
            key: Some(key),
            job: job.to_string(),
            acquired_at: Instant::now(),
        }
    }

    async fn release(mut self) -> crate::error::Result<()> {
        let Some(key) = self.key.clone() else {
            return Ok(());
        };
        // Key stays set across the await so a cancelled release still
        // falls through to Drop.
        let result = self.store.delete(&key).await;
        self.key = None;

        metrics::lock_hold_duration_ms().record(
            self.acquired_at.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("job", self.job.clone())],
        );
        record_release(&self.job, if result.is_ok() { "ok" } else { "error" });
        result
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };

        // Invocation cancelled mid-body or mid-release.
        record_release(&self.job, "deferred");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(%key, "lock dropped outside a tokio runtime, lock is stuck");
            return;
        };

        warn!(%key, "invocation cancelled while holding lock, releasing in background");
        let store = Arc::clone(&self.store);
        handle.spawn(async move {
            if let Err(e) = store.delete(&key).await {
                error!(%key, "background lock release failed, lock is stuck: {e}");
            }
        });
    }
}
