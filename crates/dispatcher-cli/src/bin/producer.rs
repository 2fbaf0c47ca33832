//! Producer binary: periodic bulk enqueue (spec §4.7) for either a single
//! day's appointments or the full active card list, backed by a JSON file
//! of card references. Swapping in the real spreadsheet importer is a
//! `CardSource` implementation, not a change to this binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use dispatcher_core::{run_batch, CardRef, CardSource, Config};
use dispatcher_store_postgres::PgJobStore;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    /// Enqueue only cards with an appointment on `--date`.
    Daily,
    /// Enqueue every active card, ignoring appointment dates.
    Sweep,
}

#[derive(Parser, Debug)]
#[command(name = "producer")]
#[command(about = "Bulk-enqueues card verification jobs", long_about = None)]
struct Args {
    #[arg(long, value_enum)]
    mode: Mode,

    /// Required for `--mode daily`; ignored for `--mode sweep`.
    #[arg(long)]
    date: Option<NaiveDate>,

    /// JSON file of card references (see `JsonCardSource`).
    #[arg(long)]
    cards_file: PathBuf,

    #[arg(long)]
    config: Option<PathBuf>,
}

/// Row shape of the JSON card file: an array of objects matching
/// [`CardRef`]'s fields, with an appointment date for `daily` filtering.
#[derive(Debug, Clone, Deserialize)]
struct CardFileRow {
    card_number: String,
    card_alt: Option<String>,
    patient_id: Option<String>,
    appointment_date: Option<NaiveDate>,
    active: Option<bool>,
}

/// Local-operation `CardSource` reading a flat JSON array from disk.
struct JsonCardSource {
    rows: Vec<CardFileRow>,
}

impl JsonCardSource {
    fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading cards file {}", path.display()))?;
        let rows: Vec<CardFileRow> =
            serde_json::from_str(&raw).context("parsing cards file as JSON")?;
        Ok(Self { rows })
    }
}

#[async_trait]
impl CardSource for JsonCardSource {
    async fn cards_with_appointments_on(
        &self,
        date: NaiveDate,
    ) -> dispatcher_core::Result<Vec<CardRef>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.appointment_date == Some(date))
            .map(row_to_card_ref)
            .collect())
    }

    async fn all_active_cards(&self) -> dispatcher_core::Result<Vec<CardRef>> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.active.unwrap_or(true))
            .map(row_to_card_ref)
            .collect())
    }
}

fn row_to_card_ref(row: &CardFileRow) -> CardRef {
    CardRef {
        card_number: row.card_number.clone(),
        card_alt: row.card_alt.clone(),
        patient_id: row.patient_id.clone(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    let source = JsonCardSource::load(&args.cards_file)?;

    let cards = match args.mode {
        Mode::Daily => {
            let date = args
                .date
                .context("--date is required for --mode daily")?;
            source.cards_with_appointments_on(date).await?
        }
        Mode::Sweep => source.all_active_cards().await?,
    };

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let store = PgJobStore::new(pool);

    let summary = run_batch(&store, &config, &cards).await;
    info!(
        total = summary.total,
        created = summary.created,
        skipped = summary.skipped,
        errors = summary.errors,
        "producer run complete"
    );
    println!(
        "{{\"total\": {}, \"created\": {}, \"skipped\": {}, \"errors\": {}}}",
        summary.total, summary.created, summary.skipped, summary.errors
    );

    Ok(())
}
