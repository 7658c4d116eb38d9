//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive.

use crate::error::Result;
use crate::model::{JobMessage, QueuedMessage};
use crate::policy::JobQueue;
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;

/// NOTIFY channel fired whenever a job is enqueued.
pub const JOBS_READY_CHANNEL: &str = "jobs_ready";

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        record_queue_op(queue_name, "create");
        Ok(())
    }

    /// Enqueue a job. Returns the pgmq message ID.
    /// delay_seconds: 0 for immediate, >0 for delayed delivery.
    ///
    /// Send and NOTIFY share a transaction, so listeners only wake for
    /// committed messages.
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job: &JobMessage,
        delay_seconds: i32,
    ) -> Result<i64> {
        let payload = serde_json::to_value(job)?;
        let mut tx = self.pool.begin().await?;

        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
            .bind(queue_name)
            .bind(&payload)
            .bind(delay_seconds)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOBS_READY_CHANNEL)
            .bind(&job.job)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        record_queue_op(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<QueuedMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(&self.pool)
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| QueuedMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        record_queue_op(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        record_queue_op(queue_name, "archive");
        Ok(())
    }
}

/// A named pgmq queue, usable as a [`Requeue`](crate::policy::Requeue) target.
#[derive(Clone)]
pub struct PgQueue {
    db: super::Db,
    name: String,
}

impl PgQueue {
    pub fn new(db: super::Db, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }
}

#[async_trait]
impl JobQueue for PgQueue {
    async fn enqueue(&self, job: &JobMessage, delay_seconds: i32) -> Result<i64> {
        self.db.enqueue(&self.name, job, delay_seconds).await
    }
}

fn record_queue_op(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
