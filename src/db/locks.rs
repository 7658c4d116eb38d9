//! Lock records in the `job_locks` table.
//!
//! The primary key on `lock_key` makes `INSERT .. ON CONFLICT DO NOTHING`
//! the atomic set-if-absent: of any number of concurrent inserts for one
//! key, exactly one returns a row.

use crate::error::Result;
use crate::key::LockKey;
use crate::store::{LockRecord, LockStore};
use async_trait::async_trait;

/// Postgres caps btree index entries at roughly 2.7kB; stay well under it.
const PG_MAX_KEY_LEN: usize = 2048;

#[async_trait]
impl LockStore for super::Db {
    async fn set_if_absent(&self, key: &LockKey) -> Result<bool> {
        let inserted: Option<(String,)> = sqlx::query_as(
            "INSERT INTO job_locks (lock_key, acquired_at) VALUES ($1, now())
             ON CONFLICT (lock_key) DO NOTHING
             RETURNING lock_key",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn delete(&self, key: &LockKey) -> Result<()> {
        sqlx::query("DELETE FROM job_locks WHERE lock_key = $1")
            .bind(key.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &LockKey) -> Result<Option<LockRecord>> {
        let row: Option<LockRow> = sqlx::query_as(
            "SELECT lock_key, acquired_at FROM job_locks WHERE lock_key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(LockRow::into_record))
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<LockRecord>> {
        let rows: Vec<LockRow> = match prefix {
            Some(prefix) => {
                sqlx::query_as(
                    "SELECT lock_key, acquired_at FROM job_locks
                     WHERE starts_with(lock_key, $1)
                     ORDER BY acquired_at, lock_key",
                )
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT lock_key, acquired_at FROM job_locks ORDER BY acquired_at, lock_key",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(LockRow::into_record).collect())
    }

    fn max_key_len(&self) -> usize {
        PG_MAX_KEY_LEN
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct LockRow {
    lock_key: String,
    acquired_at: chrono::DateTime<chrono::Utc>,
}

impl LockRow {
    fn into_record(self) -> LockRecord {
        LockRecord {
            key: LockKey::new(self.lock_key),
            acquired_at: self.acquired_at,
        }
    }
}
