//! PostgreSQL implementation of the dispatcher job queue (C1) and
//! coordinator singleton lock (C6).
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TYPE job_status AS ENUM ('pending', 'processing', 'success', 'error');
//!
//! CREATE TABLE job_sgucard (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     type TEXT NOT NULL DEFAULT 'sgucard',
//!     card_number TEXT,
//!     card_alt TEXT,
//!     patient_id TEXT,
//!
//!     status job_status NOT NULL DEFAULT 'pending',
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     last_error TEXT,
//!
//!     locked_by TEXT,
//!     locked_at TIMESTAMPTZ,
//!     locked_until TIMESTAMPTZ,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_job_sgucard_ready ON job_sgucard (status, locked_until);
//! CREATE INDEX idx_job_sgucard_card ON job_sgucard (card_number, status);
//! CREATE INDEX idx_job_sgucard_created_at ON job_sgucard (created_at);
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use dispatcher_store_postgres::PgJobStore;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/dispatcher").await?;
//! let store = PgJobStore::new(pool);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dispatcher_core::error::{DispatcherError, Result};
use dispatcher_core::job::{Job, JobStatus, JobStore};
use dispatcher_core::lock::CoordinatorLock;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const TABLE: &str = "job_sgucard";

fn db_err(e: sqlx::Error) -> DispatcherError {
    DispatcherError::Database(e.to_string())
}

fn row_to_job(row: PgRow) -> std::result::Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|e| sqlx::Error::Decode(Box::new(std::io::Error::other(e.to_string()))))?;
    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("type")?,
        card_number: row.try_get("card_number")?,
        card_alt: row.try_get("card_alt")?,
        patient_id: row.try_get("patient_id")?,
        status,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        locked_until: row.try_get("locked_until")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// PostgreSQL-backed job queue.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(
        &self,
        card: &str,
        card_alt: Option<&str>,
        patient_id: Option<&str>,
    ) -> Result<Job> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {TABLE} (type, card_number, card_alt, patient_id)
            VALUES ('sgucard', $1, $2, $3)
            RETURNING id, type, card_number, card_alt, patient_id, status, attempts,
                      last_error, locked_by, locked_at, locked_until, created_at, updated_at
            "#
        ))
        .bind(card)
        .bind(card_alt)
        .bind(patient_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row_to_job(row).map_err(db_err)
    }

    /// `FOR UPDATE SKIP LOCKED` + `UPDATE ... RETURNING` in one statement:
    /// concurrent coordinators racing this query never claim the same row
    /// twice, and neither blocks on rows the other has already locked.
    async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let locked_until = Utc::now()
            + ChronoDuration::from_std(visibility_timeout)
                .map_err(|e| DispatcherError::Structural(e.to_string()))?;

        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                  FROM {TABLE}
                 WHERE status IN ('pending', 'error')
                   AND (locked_until IS NULL OR locked_until < NOW())
                 ORDER BY created_at ASC
                 LIMIT $1
                   FOR UPDATE SKIP LOCKED
            )
            UPDATE {TABLE}
               SET status = 'processing',
                   locked_by = $2,
                   locked_at = NOW(),
                   locked_until = $3,
                   attempts = attempts + 1,
                   updated_at = NOW()
             WHERE id IN (SELECT id FROM claimable)
            RETURNING id, type, card_number, card_alt, patient_id, status, attempts,
                      last_error, locked_by, locked_at, locked_until, created_at, updated_at
            "#
        ))
        .bind(limit)
        .bind(worker_id)
        .bind(locked_until)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(row_to_job)
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)
    }

    async fn start(
        &self,
        job_id: Uuid,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<bool> {
        let locked_until = Utc::now()
            + ChronoDuration::from_std(visibility_timeout)
                .map_err(|e| DispatcherError::Structural(e.to_string()))?;

        let result = sqlx::query(&format!(
            r#"
            UPDATE {TABLE}
               SET status = 'processing',
                   locked_by = $1,
                   locked_at = NOW(),
                   locked_until = $2,
                   attempts = attempts + 1,
                   updated_at = NOW()
             WHERE id = $3
               AND status IN ('pending', 'error')
            "#
        ))
        .bind(worker_id)
        .bind(locked_until)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {TABLE}
               SET status = 'success',
                   locked_by = NULL,
                   locked_at = NULL,
                   locked_until = NULL,
                   last_error = NULL,
                   updated_at = NOW()
             WHERE id = $1
               AND status = 'processing'
               AND locked_by = $2
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, error_text: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {TABLE}
               SET status = 'error',
                   locked_by = NULL,
                   locked_at = NULL,
                   locked_until = NULL,
                   last_error = $1,
                   updated_at = NOW()
             WHERE id = $2
               AND status = 'processing'
               AND locked_by = $3
            "#
        ))
        .bind(error_text)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {TABLE}
               SET status = 'pending',
                   locked_by = NULL,
                   locked_at = NULL,
                   locked_until = NULL,
                   updated_at = NOW()
             WHERE id = $1
               AND status = 'processing'
               AND locked_by = $2
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_stale(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {TABLE}
               SET status = 'pending',
                   locked_by = NULL,
                   locked_at = NULL,
                   locked_until = NULL,
                   updated_at = NOW()
             WHERE status = 'processing'
               AND locked_until < NOW()
            "#
        ))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn by_card_success_recent(&self, card: &str, min_hours: i64) -> Result<bool> {
        let cutoff = Utc::now() - ChronoDuration::hours(min_hours);
        let row: Option<(i32,)> = sqlx::query_as(&format!(
            r#"
            SELECT 1
              FROM {TABLE}
             WHERE card_number = $1
               AND status = 'success'
               AND updated_at >= $2
             LIMIT 1
            "#
        ))
        .bind(card)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    async fn by_card_active_processing(&self, card: &str) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as(&format!(
            r#"
            SELECT 1
              FROM {TABLE}
             WHERE card_number = $1
               AND status = 'processing'
               AND locked_until >= NOW()
             LIMIT 1
            "#
        ))
        .bind(card)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.is_some())
    }

    async fn fetch_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT id, type, card_number, card_alt, patient_id, status, attempts,
                   last_error, locked_by, locked_at, locked_until, created_at, updated_at
              FROM {TABLE}
             WHERE status = $1
             ORDER BY created_at ASC
             LIMIT $2
            "#
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(row_to_job)
            .collect::<std::result::Result<_, _>>()
            .map_err(db_err)
    }
}

/// Utility functions outside the `JobStore` contract (operator tooling,
/// not used by the dispatcher loop itself).
impl PgJobStore {
    pub async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"DELETE FROM {TABLE} WHERE status = 'success' AND updated_at < $1"#
        ))
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'success') AS success,
                COUNT(*) FILTER (WHERE status = 'error') AS error
              FROM {TABLE}
            "#
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(QueueStats {
            pending: row.try_get("pending").map_err(db_err)?,
            processing: row.try_get("processing").map_err(db_err)?,
            success: row.try_get("success").map_err(db_err)?,
            error: row.try_get("error").map_err(db_err)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub success: i64,
    pub error: i64,
}

/// Coordinator singleton lock (C6) via Postgres advisory locks.
///
/// Advisory locks are session-scoped: this holds one dedicated connection
/// for the coordinator's lifetime, wrapped in a `tokio::sync::Mutex` since
/// `sqlx` connections require `&mut` for queries. The lock releases itself
/// if the process dies without calling `release`, because the connection
/// closes with it.
pub struct PgCoordinatorLock {
    conn: Mutex<sqlx::pool::PoolConnection<sqlx::Postgres>>,
}

impl PgCoordinatorLock {
    pub fn new(conn: sqlx::pool::PoolConnection<sqlx::Postgres>) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    pub async fn acquire_connection(pool: &PgPool) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>> {
        pool.acquire().await.map_err(db_err)
    }
}

#[async_trait]
impl CoordinatorLock for PgCoordinatorLock {
    async fn try_acquire(&self, worker_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let row: (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock(hashtext($1))")
            .bind(worker_id)
            .fetch_one(&mut **conn)
            .await
            .map_err(db_err)?;
        Ok(row.0)
    }

    async fn release(&self, worker_id: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
            .bind(worker_id)
            .fetch_one(&mut **conn)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
