use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use propwatch_core::{Listing, VerificationStatus};
use propwatch_matching::{MatchRepository, MatchingEngine};
use propwatch_storage::PartitionStore;
use propwatch_sync::{
    connect, extract_year_month, ingestion_tracker_for, match_repository_for,
    maybe_build_scheduler, write_run_report, AppConfig, DirectorySync, FeedIngestor,
    PgMatchRepository, UploadJob, UploadProcessor, UploadStatus, MIGRATOR,
};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "propwatch-cli")]
#[command(about = "Property withdrawal watch: price-paid ingestion and withdrawn-listing matching")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one feed file as an upload job.
    Ingest {
        path: PathBuf,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        month: Option<u32>,
    },
    /// Absorb new feed files from the configured directory.
    Sync {
        /// Keep running and re-sync on the configured cron.
        #[arg(long)]
        watch: bool,
    },
    /// Match withdrawn listings from a JSON file against stored transactions.
    Detect {
        #[arg(long)]
        listings: PathBuf,
        #[arg(long)]
        agency: Option<String>,
    },
    /// Apply database migrations.
    Migrate,
    /// Show ingestion history and published partitions.
    History,
    /// List persisted matches.
    Matches {
        #[arg(long, default_value_t = 0.0)]
        min: f64,
        #[arg(long, default_value_t = 100.0)]
        max: f64,
        #[arg(long)]
        status: Option<VerificationStatus>,
        #[arg(long)]
        listing: Option<String>,
    },
    /// Move a suspicious match to its verified status.
    Resolve {
        id: Uuid,
        status: VerificationStatus,
        #[arg(long)]
        owner: Option<String>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sqlx=warn".into());
    let json = std::env::var("PROPWATCH_LOG_JSON").is_ok_and(|v| matches!(v.as_str(), "1" | "true"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Sync { watch: false }) {
        Commands::Ingest { path, year, month } => {
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let detected = extract_year_month(&filename);
            let Some(year) = year.or(detected.map(|(y, _)| y)) else {
                bail!("no year given and none found in {filename}; pass --year");
            };
            let month = month.or(detected.and_then(|(_, m)| m));

            let store = PartitionStore::open(config.store.clone())?;
            let tracker = ingestion_tracker_for(&config, &store).await?;
            let processor = UploadProcessor::new(FeedIngestor::new(store, tracker));
            let job = processor.process(UploadJob::new(path, year, month)).await;
            println!("{}", serde_json::to_string_pretty(&job)?);
            if job.status == UploadStatus::Failed {
                bail!("upload {} failed", job.id);
            }
        }
        Commands::Sync { watch } => {
            let store = PartitionStore::open(config.store.clone())?;
            let tracker = ingestion_tracker_for(&config, &store).await?;
            let sync = Arc::new(DirectorySync::new(
                FeedIngestor::new(store, tracker),
                &config.csv_dir,
            ));

            let started_at = Utc::now();
            let run_id = Uuid::new_v4();
            let summary = sync.run_once().await?;
            let report = write_run_report(&config.reports_dir, run_id, "sync", started_at, &summary).await?;
            println!(
                "sync complete: run_id={} found={} skipped={} ingested={} failed={} report={}",
                run_id,
                summary.total_files_found,
                summary.already_ingested,
                summary.newly_ingested,
                summary.failed,
                report.display()
            );

            if watch {
                let Some(sched) = maybe_build_scheduler(&config, Arc::clone(&sync)).await? else {
                    bail!("--watch needs SYNC_PPD=true");
                };
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "watching for new feed files");
                tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
            }
        }
        Commands::Detect { listings, agency } => {
            let body = tokio::fs::read(&listings)
                .await
                .with_context(|| format!("reading {}", listings.display()))?;
            let listings: Vec<Listing> =
                serde_json::from_slice(&body).context("parsing listings JSON")?;

            let store = PartitionStore::open(config.store.clone())?;
            let repository = match_repository_for(&config).await?;
            let engine = MatchingEngine::new(config.detection.clone(), Arc::new(store), repository)?;

            let started_at = Utc::now();
            let run_id = Uuid::new_v4();
            let summary = match agency {
                Some(agency_id) => engine.detect_for_agency(&agency_id, &listings).await?,
                None => engine.detect(&listings).await?,
            };
            let report = write_run_report(&config.reports_dir, run_id, "detect", started_at, &summary).await?;
            println!(
                "detect complete: run_id={} scanned={} matches={} high={} medium={} near_misses={} persisted={} failed_listings={} report={}",
                run_id,
                summary.listings_scanned,
                summary.total_matches,
                summary.confidence_histogram.high,
                summary.confidence_histogram.medium,
                summary.confidence_histogram.low,
                summary.newly_persisted,
                summary.failed_listings,
                report.display()
            );
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let pool = connect(url).await?;
            MIGRATOR.run(&pool).await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::History => {
            let store = PartitionStore::open(config.store.clone())?;
            let tracker = ingestion_tracker_for(&config, &store).await?;
            println!("partitions:");
            for partition in store.partitions()? {
                println!(
                    "  {} rows={} bytes={} path={}",
                    partition.year,
                    partition.row_count,
                    partition.bytes,
                    partition.path.display()
                );
            }
            println!("ingested files:");
            for record in tracker.history().await? {
                println!(
                    "  {} year={} month={} rows={} sha256={} at={}",
                    record.source_filename,
                    record.year,
                    record.month.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                    record.row_count,
                    record.content_sha256.as_deref().unwrap_or("-"),
                    record.ingested_at
                );
            }
        }
        Commands::Matches {
            min,
            max,
            status,
            listing,
        } => {
            let repository = pg_repository(&config).await?;
            let rows = match (status, listing) {
                (Some(status), _) => repository.by_status(status).await?,
                (None, Some(listing_id)) => repository.by_listing(&listing_id).await?,
                (None, None) => repository.by_confidence(min, max).await?,
            };
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Resolve { id, status, owner } => {
            let repository = pg_repository(&config).await?;
            let updated = repository.transition_status(id, status, owner).await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
    }

    Ok(())
}

async fn pg_repository(config: &AppConfig) -> Result<PgMatchRepository> {
    let Some(url) = config.database_url.as_deref() else {
        bail!("DATABASE_URL must be set to read persisted matches");
    };
    Ok(PgMatchRepository::new(connect(url).await?))
}
