//! Job model and the policy-light `JobStore` trait.
//!
//! `JobStore` is deliberately small: every operation maps to one predicate-
//! guarded SQL statement in the Postgres implementation. Nothing here knows
//! about backends, HTTP, or dispatch policy — that lives in [`crate::backend`],
//! [`crate::worker`] and [`crate::dispatcher`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// The only job type in scope. Kept as a constant rather than an enum so a
/// second type can be added without a breaking change to the table layout.
pub const JOB_TYPE_SGUCARD: &str = "sgucard";

/// Queue state of a [`Job`]. See the state machine in the module-level docs
/// of [`crate::dispatcher`] for the allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::DispatcherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            other => Err(crate::error::DispatcherError::Structural(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// One row of the `job_sgucard` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub card_number: Option<String>,
    pub card_alt: Option<String>,
    pub patient_id: Option<String>,
    pub status: JobStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Invariant 1/2 of the data model: lease fields are all-or-nothing,
    /// and only present while `Processing`.
    pub fn lease_consistent(&self) -> bool {
        let all_locked = self.locked_by.is_some()
            && self.locked_at.is_some()
            && self.locked_until.is_some();
        let all_unlocked =
            self.locked_by.is_none() && self.locked_at.is_none() && self.locked_until.is_none();
        match self.status {
            JobStatus::Processing => all_locked,
            JobStatus::Pending | JobStatus::Success | JobStatus::Error => all_unlocked,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until < now)
    }
}

/// The queue interface the dispatcher, worker and producer depend on.
///
/// Implementations must make `claim`, `start`, `complete`, `fail` and
/// `release` single atomic statements (row lock or predicate-guarded
/// `UPDATE ... RETURNING`) so concurrent callers never double-claim or
/// clobber a terminal state written by another coordinator.
///
/// `worker_id` is the lock identity throughout: the same string passed to
/// `claim`/`start` is the one that must be passed back to `complete`/`fail`/
/// `release`, or the guarded `UPDATE` affects zero rows and the call
/// returns `Ok(false)`. It identifies the coordinator process, not an
/// individual backend slot — [`crate::backend::BackendRegistry`] tracks
/// per-backend busy/free state separately, in memory.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job. Never fails on duplicates — de-duplication
    /// is the producer's job (see [`crate::producer`]).
    async fn insert(
        &self,
        card: &str,
        card_alt: Option<&str>,
        patient_id: Option<&str>,
    ) -> crate::error::Result<Job>;

    /// Atomically claim up to `limit` ready rows (`pending` or `error`,
    /// unexpired lease), ordered by `created_at` ascending.
    async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        visibility_timeout: Duration,
    ) -> crate::error::Result<Vec<Job>>;

    /// Optimistic claim of one specific job already fetched by the caller.
    /// Succeeds iff the row is still `pending` or `error`.
    async fn start(
        &self,
        job_id: Uuid,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> crate::error::Result<bool>;

    /// Terminal success transition, guarded on `status = processing AND
    /// locked_by = worker_id`.
    async fn complete(&self, job_id: Uuid, worker_id: &str) -> crate::error::Result<bool>;

    /// Terminal error transition, same guard as `complete`.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_text: &str,
    ) -> crate::error::Result<bool>;

    /// Converts `processing -> pending` for a lease still held by `worker_id`.
    /// Used on graceful coordinator shutdown.
    async fn release(&self, job_id: Uuid, worker_id: &str) -> crate::error::Result<bool>;

    /// Resets rows with an expired lease back to `pending`; returns the
    /// count reset. The only recovery mechanism for crashed workers.
    async fn purge_stale(&self) -> crate::error::Result<u64>;

    /// True if a row for `card` reached `success` within the last
    /// `min_hours` hours.
    async fn by_card_success_recent(
        &self,
        card: &str,
        min_hours: i64,
    ) -> crate::error::Result<bool>;

    /// True if a row for `card` is currently `processing` with a live lease.
    async fn by_card_active_processing(&self, card: &str) -> crate::error::Result<bool>;

    /// Plain fetch used by the dispatcher's fallback path when `claim`
    /// returns nothing, and by the producer's `skip_existing` check.
    async fn fetch_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> crate::error::Result<Vec<Job>>;
}
