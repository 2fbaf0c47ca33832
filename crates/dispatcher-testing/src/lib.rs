//! In-memory [`JobStore`] double for testing the dispatcher, producer and
//! worker logic without a database.
//!
//! Every predicate the Postgres implementation expresses in SQL is
//! reproduced here in plain Rust against a `Mutex<Vec<Job>>`, so property
//! tests (single-flight, monotonic attempts, lease consistency) exercise
//! the same contract `dispatcher-store-postgres` promises.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use dispatcher_core::error::{DispatcherError, Result};
use dispatcher_core::job::{Job, JobStatus, JobStore, JOB_TYPE_SGUCARD};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

pub struct InMemoryJobStore {
    rows: Mutex<Vec<Job>>,
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of every row, for assertions in tests.
    pub fn snapshot(&self) -> Vec<Job> {
        self.rows.lock().unwrap().clone()
    }

    /// Seed a row directly, bypassing `insert`'s defaults. Handy for
    /// constructing lease-expiry and contention fixtures.
    pub fn seed(&self, job: Job) {
        self.rows.lock().unwrap().push(job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(
        &self,
        card: &str,
        card_alt: Option<&str>,
        patient_id: Option<&str>,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            job_type: JOB_TYPE_SGUCARD.to_string(),
            card_number: Some(card.to_string()),
            card_alt: card_alt.map(str::to_string),
            patient_id: patient_id.map(str::to_string),
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            locked_by: None,
            locked_at: None,
            locked_until: None,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<Job>> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let mut ready_indices: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, j)| {
                matches!(j.status, JobStatus::Pending | JobStatus::Error)
                    && j.locked_until.map(|u| u < now).unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();
        ready_indices.sort_by_key(|&i| rows[i].created_at);
        ready_indices.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ready_indices.len());
        for i in ready_indices {
            let job = &mut rows[i];
            job.status = JobStatus::Processing;
            job.locked_by = Some(worker_id.to_string());
            job.locked_at = Some(now);
            job.locked_until = Some(
                now + ChronoDuration::from_std(visibility_timeout)
                    .map_err(|e| DispatcherError::Structural(e.to_string()))?,
            );
            job.attempts += 1;
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn start(
        &self,
        job_id: Uuid,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let Some(job) = rows.iter_mut().find(|j| j.id == job_id) else {
            return Ok(false);
        };
        if !matches!(job.status, JobStatus::Pending | JobStatus::Error) {
            return Ok(false);
        }
        job.status = JobStatus::Processing;
        job.locked_by = Some(worker_id.to_string());
        job.locked_at = Some(now);
        job.locked_until = Some(
            now + ChronoDuration::from_std(visibility_timeout)
                .map_err(|e| DispatcherError::Structural(e.to_string()))?,
        );
        job.attempts += 1;
        job.updated_at = now;
        Ok(true)
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(job) = rows.iter_mut().find(|j| j.id == job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.status = JobStatus::Success;
        job.locked_by = None;
        job.locked_at = None;
        job.locked_until = None;
        job.last_error = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, error_text: &str) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(job) = rows.iter_mut().find(|j| j.id == job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.status = JobStatus::Error;
        job.locked_by = None;
        job.locked_at = None;
        job.locked_until = None;
        job.last_error = Some(error_text.to_string());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let Some(job) = rows.iter_mut().find(|j| j.id == job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.locked_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.status = JobStatus::Pending;
        job.locked_by = None;
        job.locked_at = None;
        job.locked_until = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn purge_stale(&self) -> Result<u64> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let mut count = 0u64;
        for job in rows.iter_mut() {
            if job.status == JobStatus::Processing
                && job.locked_until.map(|u| u < now).unwrap_or(false)
            {
                job.status = JobStatus::Pending;
                job.locked_by = None;
                job.locked_at = None;
                job.locked_until = None;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn by_card_success_recent(&self, card: &str, min_hours: i64) -> Result<bool> {
        let cutoff = Utc::now() - ChronoDuration::hours(min_hours);
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().any(|j| {
            j.card_number.as_deref() == Some(card)
                && j.status == JobStatus::Success
                && j.updated_at >= cutoff
        }))
    }

    async fn by_card_active_processing(&self, card: &str) -> Result<bool> {
        let now = Utc::now();
        let rows = self.rows.lock().unwrap();
        Ok(rows.iter().any(|j| {
            j.card_number.as_deref() == Some(card)
                && j.status == JobStatus::Processing
                && j.locked_until.map(|u| u >= now).unwrap_or(false)
        }))
    }

    async fn fetch_by_status(&self, status: JobStatus, limit: i64) -> Result<Vec<Job>> {
        let rows = self.rows.lock().unwrap();
        let mut matching: Vec<Job> = rows.iter().filter(|j| j.status == status).cloned().collect();
        matching.sort_by_key(|j| j.created_at);
        if limit >= 0 {
            matching.truncate(limit as usize);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_claim_then_complete_round_trip() {
        let store = InMemoryJobStore::new();
        let job = store.insert("0064.8000.400948.00-5", None, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let claimed = store
            .claim("worker-1:1", 10, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].status, JobStatus::Processing);

        let ok = store.complete(job.id, "worker-1:1").await.unwrap();
        assert!(ok);

        let final_job = store.snapshot().into_iter().next().unwrap();
        assert_eq!(final_job.status, JobStatus::Success);
        assert_eq!(final_job.attempts, 1);
        assert!(final_job.locked_by.is_none());
    }

    #[tokio::test]
    async fn purge_stale_reopens_expired_lease() {
        let store = InMemoryJobStore::new();
        let job = store.insert("card-x", None, None).await.unwrap();
        store
            .claim("worker-1:1", 10, Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let purged = store.purge_stale().await.unwrap();
        assert_eq!(purged, 1);

        let row = store.snapshot().into_iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert!(row.locked_by.is_none());
        assert_eq!(row.attempts, 1);

        // Second purge is idempotent: nothing new expired.
        assert_eq!(store.purge_stale().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn complete_rejects_wrong_slot() {
        let store = InMemoryJobStore::new();
        let job = store.insert("card-y", None, None).await.unwrap();
        store
            .claim("worker-1:1", 10, Duration::from_secs(60))
            .await
            .unwrap();

        let ok = store.complete(job.id, "worker-1:2").await.unwrap();
        assert!(!ok);

        let row = store.snapshot().into_iter().next().unwrap();
        assert_eq!(row.status, JobStatus::Processing);
    }
}
