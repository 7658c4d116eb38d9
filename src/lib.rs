//! # workq-lock
//!
//! Run at most one instance of a job identity at a time across a fleet of
//! workers sharing a lock store, and decide what happens to the duplicate.
//!
//! A [`LockGuard`] derives a [`LockKey`] from the job's name and arguments,
//! takes it with an atomic set-if-absent, runs the job body and deletes the
//! key on every exit path. When the key is already held the body does not
//! run; the guard's [`LockPolicy::job_locked`] does (a no-op unless
//! overridden).
//!
//! ```no_run
//! use std::sync::Arc;
//! use workq_lock::{JobArgs, LockGuard, MemoryStore, Performed};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = LockGuard::new(Arc::new(MemoryStore::new()));
//! let args: JobArgs = ["repo42"].into_iter().collect();
//!
//! let performed = guard
//!     .perform("Sync", &args, || async { Ok::<_, std::io::Error>("synced") })
//!     .await?;
//! assert_eq!(performed, Performed::Ran("synced"));
//! # Ok(())
//! # }
//! ```
//!
//! Postgres provides the shared store ([`db::Db`]) and the pgmq transport
//! the reference [`worker::Worker`] reads from.

pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod key;
pub mod model;
pub mod policy;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
pub use guard::{LockGuard, PerformError, Performed};
pub use key::{JobArgs, LockKey};
pub use policy::{ClassLock, DefaultPolicy, FixedKey, LockPolicy, Requeue};
pub use store::{LockRecord, LockStore, MemoryStore};
