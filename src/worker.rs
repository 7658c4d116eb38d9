//! Worker: reads job messages from pgmq and runs each one under its lock.
//!
//! Every registered job gets its own [`LockGuard`] over the shared store, so
//! each job brings its own key derivation and contention handling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Db;
use crate::db::pgmq::JOBS_READY_CHANNEL;
use crate::error::Result;
use crate::guard::{LockGuard, PerformError, Performed};
use crate::key::JobArgs;
use crate::model::JobMessage;
use crate::policy::LockPolicy;
use crate::store::LockStore;
use crate::telemetry::metrics;

/// Error type job bodies return.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// A job the worker can run.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Identity used for routing and lock keys.
    fn name(&self) -> &str;

    async fn perform(&self, args: &JobArgs) -> std::result::Result<(), JobError>;
}

/// How one message was handled.
#[derive(Debug)]
pub enum Dispatch {
    /// Lock acquired, job ran to completion, lock released.
    Ran,
    /// Another invocation holds the lock; the job's `job_locked` ran.
    Locked,
    /// The job returned an error (lock released).
    Failed(JobError),
    /// The lock store failed before the job could run.
    LockFailed(String),
    /// The derived lock key is unusable (empty or too long). The message
    /// would fail the same way on every delivery.
    InvalidKey(String),
    /// The job ran but its lock could not be released.
    Stuck(String),
    /// No job registered under this name.
    Unroutable,
}

impl Dispatch {
    /// Whether the message is done with and should leave the queue.
    /// Job and store failures stay for redelivery. An invalid key is archived
    /// like an unroutable message.
    pub fn retires_message(&self) -> bool {
        !matches!(self, Dispatch::Failed(_) | Dispatch::LockFailed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Dispatch::Ran => "ran",
            Dispatch::Locked => "locked",
            Dispatch::Failed(_) => "failed",
            Dispatch::LockFailed(_) => "error",
            Dispatch::InvalidKey(_) => "invalid_key",
            Dispatch::Stuck(_) => "stuck",
            Dispatch::Unroutable => "unroutable",
        }
    }
}

struct Registered {
    job: Arc<dyn Job>,
    guard: LockGuard,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Jobs by name, each paired with its lock guard.
pub struct JobRegistry {
    store: Arc<dyn LockStore>,
    jobs: HashMap<String, Registered>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            jobs: HashMap::new(),
        }
    }

    /// Register a job with the default lock policy.
    pub fn register(&mut self, job: impl Job + 'static) -> &mut Self {
        let guard = LockGuard::new(Arc::clone(&self.store));
        self.insert(Arc::new(job), guard)
    }

    /// Register a job with its own lock policy.
    pub fn register_with(
        &mut self,
        job: impl Job + 'static,
        policy: impl LockPolicy + 'static,
    ) -> &mut Self {
        let guard = LockGuard::new(Arc::clone(&self.store)).with_policy(policy);
        self.insert(Arc::new(job), guard)
    }

    fn insert(&mut self, job: Arc<dyn Job>, guard: LockGuard) -> &mut Self {
        let name = job.name().to_string();
        if self.jobs.insert(name.clone(), Registered { job, guard }).is_some() {
            warn!(job = %name, "job registered twice, keeping the latest");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    /// Run one job message through its lock guard.
    pub async fn dispatch(&self, message: &JobMessage) -> Dispatch {
        let Some(registered) = self.jobs.get(&message.job) else {
            warn!(job = %message.job, "no job registered under this name");
            return Dispatch::Unroutable;
        };

        let job = Arc::clone(&registered.job);
        let args = &message.args;
        let dispatch = match registered
            .guard
            .perform(&message.job, args, || async move { job.perform(args).await })
            .await
        {
            Ok(Performed::Ran(())) => Dispatch::Ran,
            Ok(Performed::Locked) => Dispatch::Locked,
            Err(PerformError::Job(e)) => Dispatch::Failed(e),
            Err(PerformError::Release { key, source }) => {
                Dispatch::Stuck(format!("lock {key} not released: {source}"))
            }
            Err(PerformError::InvalidKey(e)) => Dispatch::InvalidKey(e.to_string()),
            Err(e) => Dispatch::LockFailed(e.to_string()),
        };

        metrics::jobs_processed().add(
            1,
            &[
                KeyValue::new("job", message.job.clone()),
                KeyValue::new("outcome", dispatch.label()),
            ],
        );
        dispatch
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    /// Visibility timeout (seconds) for pgmq reads.
    pub visibility_timeout: i32,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: "jobs".to_string(),
            visibility_timeout: 60,
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            queue: config.queue.clone(),
            visibility_timeout: config.visibility_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

/// The worker loop: wait for jobs, dispatch them, retire messages.
#[derive(Clone)]
pub struct Worker {
    id: Uuid,
    db: Db,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(db: Db, registry: JobRegistry, config: WorkerConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            db,
            registry: Arc::new(registry),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Signal the worker to stop after the current job.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut listener = sqlx::postgres::PgListener::connect_with(self.db.pool()).await?;
        listener.listen(JOBS_READY_CHANNEL).await?;

        info!(worker = %self.id, queue = %self.config.queue, "worker started");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(worker = %self.id, "worker shutting down");
                    return Ok(());
                }
                notif = listener.recv() => {
                    match notif {
                        Ok(n) => info!(job = n.payload(), "notified of new job"),
                        Err(e) => warn!("PgListener error: {e}, falling back to poll"),
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.drain().await {
                error!("process error: {e}");
            }
        }
    }

    /// Process messages until the queue has nothing visible.
    async fn drain(&self) -> Result<()> {
        while self.run_once().await? {}
        Ok(())
    }

    /// Read and handle at most one message. Returns false if the queue was empty.
    pub async fn run_once(&self) -> Result<bool> {
        let Some(msg) = self
            .db
            .read_from_queue(&self.config.queue, self.config.visibility_timeout)
            .await?
        else {
            return Ok(false);
        };

        let message = match msg.job() {
            Ok(message) => message,
            Err(e) => {
                warn!(msg_id = msg.msg_id, "dead-lettering undecodable message: {e}");
                self.db.archive_message(&self.config.queue, msg.msg_id).await?;
                return Ok(true);
            }
        };

        let dispatch = self.registry.dispatch(&message).await;
        match &dispatch {
            Dispatch::Ran => info!(job = %message.job, args = %message.args, "job completed"),
            Dispatch::Locked => {
                info!(job = %message.job, args = %message.args, "job locked, handed to job_locked")
            }
            Dispatch::Failed(e) => error!(
                job = %message.job,
                args = %message.args,
                attempt = msg.read_ct,
                "job failed, leaving for redelivery: {e}"
            ),
            Dispatch::LockFailed(e) => {
                error!(job = %message.job, "lock store unavailable, leaving for redelivery: {e}")
            }
            Dispatch::InvalidKey(e) => {
                warn!(msg_id = msg.msg_id, job = %message.job, "dead-lettering message with unusable lock key: {e}")
            }
            Dispatch::Stuck(e) => error!(job = %message.job, "{e}"),
            Dispatch::Unroutable => {}
        }

        if dispatch.retires_message() {
            self.db.archive_message(&self.config.queue, msg.msg_id).await?;
        }
        Ok(true)
    }
}
