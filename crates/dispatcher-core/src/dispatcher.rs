//! Dispatcher loop (C3): the single coordinator loop described in spec
//! §4.3.
//!
//! ```text
//! purge_stale -> compute free+healthy backends -> claim work (with a
//! plain-SELECT fallback) -> pair jobs with backends -> spawn workers
//! ```
//!
//! `Job` status only ever moves `pending|error -> processing -> {success,
//! error}`, or `processing -> pending` via `purge_stale`/`release` — this
//! loop is the only writer of the `-> processing` edge.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::job::{Job, JobStatus, JobStore};
use crate::worker::{run_worker, Dispatch};

pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<BackendRegistry>,
    http: reqwest::Client,
    config: Config,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<BackendRegistry>,
        config: Config,
    ) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout())
            .build()?;
        Ok(Self {
            store,
            registry,
            http,
            config,
        })
    }

    /// Run until `cancel` is signalled. Exits cleanly between iterations —
    /// never mid-dispatch — so a shutdown never leaves a job half-claimed.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                info!("dispatcher loop exiting on cancellation");
                return;
            }

            if let Err(err) = self.tick().await {
                warn!(error = %err, "dispatcher cycle aborted; resuming next cycle");
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval()) => {}
                _ = cancel.cancelled() => {
                    info!("dispatcher loop exiting on cancellation");
                    return;
                }
            }
        }
    }

    /// One full iteration of the loop, exposed separately so tests can
    /// drive it deterministically instead of racing a timer.
    pub async fn tick(&self) -> crate::error::Result<()> {
        let purged = self.store.purge_stale().await?;
        if purged > 0 {
            info!(count = purged, "reopened stale processing jobs");
        }

        let free = self.registry.free_healthy().await;
        if free.is_empty() {
            debug!("no free healthy backends this cycle");
            return Ok(());
        }

        let mut jobs = self
            .store
            .claim(&self.config.worker_id, free.len() as i64, self.config.visibility_timeout())
            .await?;

        if jobs.is_empty() {
            jobs = self
                .store
                .fetch_by_status(JobStatus::Pending, free.len() as i64)
                .await?;
        }
        if jobs.is_empty() {
            jobs = self
                .store
                .fetch_by_status(JobStatus::Error, free.len() as i64)
                .await?;
        }
        if jobs.is_empty() {
            return Ok(());
        }

        for (job, backend) in jobs.into_iter().zip(free.into_iter()) {
            self.dispatch_one(job, backend.index, backend.url).await;
            sleep(self.config.dispatch_stagger()).await;
        }

        Ok(())
    }

    pub(crate) async fn dispatch_one(&self, job: Job, backend_index: usize, backend_url: String) {
        let worker_id = self.config.worker_id.clone();
        let slot_id = format!("{}:{}", worker_id, backend_index + 1);

        let Some(card_number) = job.card_number.clone() else {
            if let Err(err) = self.store.fail(job.id, &worker_id, "missing card").await {
                warn!(job_id = %job.id, error = %err, "failed to mark job with missing card as error");
            }
            return;
        };

        if job.status != JobStatus::Processing {
            match self
                .store
                .start(job.id, &worker_id, self.config.visibility_timeout())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(job_id = %job.id, "job could not be started (status changed); skipping");
                    return;
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "failed to start job; skipping this cycle");
                    return;
                }
            }
        }

        self.registry.mark_busy(backend_index).await;

        let dispatch = Dispatch {
            job_id: job.id,
            card_number,
            backend_index,
            backend_url,
            worker_id,
            slot_id,
        };

        let http = self.http.clone();
        let registry = self.registry.clone();
        let store = self.store.clone();
        let verify_path = self.config.verify_path.clone();
        let api_token = self.config.api_token.clone();
        let api_timeout = self.config.api_timeout();
        let cooldown = Duration::from_millis(self.config.post_job_cooldown_seconds * 1000);

        tokio::spawn(async move {
            run_worker(dispatch, http, store, &verify_path, &api_token, api_timeout).await;
            if !cooldown.is_zero() {
                sleep(cooldown).await;
            }
            registry.mark_free(backend_index).await;
        });
    }
}
