//! Producer interface (C5) and the `CardSource` seam periodic producers
//! (C7) use to learn which cards to enqueue.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::config::Config;
use crate::job::{Job, JobStatus, JobStore};

/// Why `create_job` declined to insert a row. Matches the original
/// implementation's `should_skip` reasons verbatim so operators reading
/// logs across the rewrite see the same vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ProcessingActive,
    RecentSuccess,
    PendingOrProcessingExists,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ProcessingActive => "processing_active",
            SkipReason::RecentSuccess => "recent_success",
            SkipReason::PendingOrProcessingExists => "pending_or_processing_exists",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Job),
    Skipped(SkipReason),
}

/// Insert a job for `card`, applying the de-duplication policy from spec
/// §4.5. Filters are OR'd; the first match wins in the order below, which
/// mirrors the original script's check order (active processing, then
/// recent success, then existing pending/processing).
pub async fn create_job(
    store: &dyn JobStore,
    config: &Config,
    card: &str,
    card_alt: Option<&str>,
    patient_id: Option<&str>,
) -> crate::error::Result<CreateOutcome> {
    if !config.skip_existing {
        let job = store.insert(card, card_alt, patient_id).await?;
        return Ok(CreateOutcome::Created(job));
    }

    if config.skip_active_processing && store.by_card_active_processing(card).await? {
        return Ok(CreateOutcome::Skipped(SkipReason::ProcessingActive));
    }

    if config.skip_recent_success_hours > 0
        && store
            .by_card_success_recent(card, config.skip_recent_success_hours)
            .await?
    {
        return Ok(CreateOutcome::Skipped(SkipReason::RecentSuccess));
    }

    if has_pending_or_processing(store, card).await? {
        return Ok(CreateOutcome::Skipped(
            SkipReason::PendingOrProcessingExists,
        ));
    }

    let job = store.insert(card, card_alt, patient_id).await?;
    Ok(CreateOutcome::Created(job))
}

async fn has_pending_or_processing(store: &dyn JobStore, card: &str) -> crate::error::Result<bool> {
    for status in [JobStatus::Pending, JobStatus::Processing] {
        let rows = store.fetch_by_status(status, i64::MAX).await?;
        if rows.iter().any(|j| j.card_number.as_deref() == Some(card)) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A card reference yielded by an external card/appointment source. The
/// real spreadsheet importer is out of scope (spec §1); this trait is the
/// seam it plugs into.
#[derive(Debug, Clone, PartialEq)]
pub struct CardRef {
    pub card_number: String,
    pub card_alt: Option<String>,
    pub patient_id: Option<String>,
}

#[async_trait]
pub trait CardSource: Send + Sync {
    async fn cards_with_appointments_on(
        &self,
        date: NaiveDate,
    ) -> crate::error::Result<Vec<CardRef>>;

    async fn all_active_cards(&self) -> crate::error::Result<Vec<CardRef>>;
}

/// Summary of a batch producer run, matching the shape the original
/// scripts printed at the end of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub total: usize,
    pub created: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Run `create_job` for every card in `cards`, accumulating a summary.
/// Used by both canonical periodic producers (daily window, full sweep).
pub async fn run_batch(
    store: &dyn JobStore,
    config: &Config,
    cards: &[CardRef],
) -> ProducerSummary {
    let mut summary = ProducerSummary {
        total: cards.len(),
        ..Default::default()
    };

    for card in cards {
        match create_job(
            store,
            config,
            &card.card_number,
            card.card_alt.as_deref(),
            card.patient_id.as_deref(),
        )
        .await
        {
            Ok(CreateOutcome::Created(_)) => summary.created += 1,
            Ok(CreateOutcome::Skipped(reason)) => {
                tracing::info!(card = %card.card_number, reason = reason.as_str(), "skipped");
                summary.skipped += 1;
            }
            Err(err) => {
                tracing::warn!(card = %card.card_number, error = %err, "failed to create job");
                summary.errors += 1;
            }
        }

        if config.rate_limit_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(config.rate_limit_ms)).await;
        }
    }

    summary
}
