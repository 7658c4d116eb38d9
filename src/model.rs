//! Queue payload types.
//!
//! A job message names the job to run and carries its arguments. The lock
//! protocol never looks inside the message beyond those two fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::JobArgs;

/// Payload stored in the pgmq queue for one job invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Job identity, used for routing and lock key derivation.
    pub job: String,
    #[serde(default)]
    pub args: JobArgs,
}

impl JobMessage {
    pub fn new(job: impl Into<String>, args: JobArgs) -> Self {
        Self {
            job: job.into(),
            args,
        }
    }
}

/// A message read from the queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub msg_id: i64,
    /// How many times this message has been read, including this read.
    pub read_ct: i32,
    pub enqueued_at: DateTime<Utc>,
    /// When the message becomes visible again if not archived.
    pub vt: DateTime<Utc>,
    /// Raw payload. Decode with [`QueuedMessage::job`].
    pub message: serde_json::Value,
}

impl QueuedMessage {
    /// Decode the payload as a [`JobMessage`].
    pub fn job(&self) -> crate::error::Result<JobMessage> {
        Ok(JobMessage::deserialize(&self.message)?)
    }
}
