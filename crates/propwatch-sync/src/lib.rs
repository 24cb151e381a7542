//! Sync orchestration: feed directory scans, upload jobs, scheduling and persistence wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use propwatch_core::{IngestionOutcome, IngestionRecord};
use propwatch_matching::{InMemoryMatchRepository, MatchRepository};
use propwatch_storage::{file_sha256, IngestionTracker, JsonlIngestionTracker, PartitionStore};
use serde::Serialize;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config;
pub mod directory;
pub mod postgres;
pub mod upload;

pub use config::AppConfig;
pub use directory::{extract_year_month, DirectorySync, DirectorySyncSummary};
pub use postgres::{connect, PgIngestionTracker, PgMatchRepository, MIGRATOR};
pub use upload::{UploadJob, UploadProcessor, UploadStatus};

pub const CRATE_NAME: &str = "propwatch-sync";

/// Feed file ingestion plus history bookkeeping, shared by directory sync and upload jobs.
#[derive(Clone)]
pub struct FeedIngestor {
    store: PartitionStore,
    tracker: Arc<dyn IngestionTracker>,
}

impl FeedIngestor {
    pub fn new(store: PartitionStore, tracker: Arc<dyn IngestionTracker>) -> Self {
        Self { store, tracker }
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn tracker(&self) -> &Arc<dyn IngestionTracker> {
        &self.tracker
    }

    /// Ingest one feed file into its year partition. History is recorded only
    /// when at least one row was published.
    pub async fn ingest_file(
        &self,
        filename: &str,
        path: &Path,
        year: i32,
        month: Option<u32>,
    ) -> Result<IngestionOutcome> {
        let store = self.store.clone();
        let source = path.to_path_buf();
        let outcome = tokio::task::spawn_blocking(move || store.ingest_csv(&source, year))
            .await
            .context("ingestion worker panicked")?
            .with_context(|| format!("ingesting {}", path.display()))?;

        let Some(location) = outcome.location.clone().filter(|_| outcome.published()) else {
            return Ok(outcome);
        };

        let superseded = self.superseded_by(year, filename).await?;
        if !superseded.is_empty() {
            warn!(
                filename,
                year,
                superseded = %superseded.join(", "),
                "partition replaced; rows from earlier files for this year are gone"
            );
        }

        let content_sha256 = match file_sha256(path).await {
            Ok(digest) => Some(digest),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not fingerprint feed file");
                None
            }
        };
        let record = IngestionRecord {
            source_filename: filename.to_string(),
            source_path: Some(path.to_path_buf()),
            location,
            year,
            month,
            row_count: outcome.successful,
            content_sha256,
            ingested_at: Utc::now(),
        };
        if !self
            .tracker
            .record(record)
            .await
            .with_context(|| format!("recording ingestion of {filename}"))?
        {
            warn!(filename, "history already held this filename");
        }
        Ok(outcome)
    }

    /// Files already in history for `year` under a different name. Their rows
    /// do not survive a publish of `filename`, since a partition holds one
    /// file's worth of rows.
    pub async fn superseded_by(&self, year: i32, filename: &str) -> Result<Vec<String>> {
        let history = self.tracker.history().await.context("reading ingestion history")?;
        Ok(history
            .into_iter()
            .filter(|record| record.year == year && record.source_filename != filename)
            .map(|record| record.source_filename)
            .collect())
    }

    pub async fn sweep_temp_files(&self) -> Result<usize> {
        let store = self.store.clone();
        let removed = tokio::task::spawn_blocking(move || store.sweep_temp_files())
            .await
            .context("sweep worker panicked")??;
        Ok(removed)
    }
}

/// Postgres when a database URL is configured, otherwise the JSON-lines history in the store root.
pub async fn ingestion_tracker_for(
    config: &AppConfig,
    store: &PartitionStore,
) -> Result<Arc<dyn IngestionTracker>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(PgIngestionTracker::new(connect(url).await?))),
        None => Ok(Arc::new(JsonlIngestionTracker::in_store_root(store.root()))),
    }
}

pub async fn match_repository_for(config: &AppConfig) -> Result<Arc<dyn MatchRepository>> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(PgMatchRepository::new(connect(url).await?))),
        None => {
            warn!("DATABASE_URL not set; matches are kept in memory for this run only");
            Ok(Arc::new(InMemoryMatchRepository::new()))
        }
    }
}

#[derive(Debug, Serialize)]
struct RunReport<'a, T: Serialize> {
    run_id: Uuid,
    kind: &'a str,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    summary: &'a T,
}

/// Write `<reports_dir>/<run_id>/<kind>.json` and return its path.
pub async fn write_run_report<T: Serialize>(
    reports_dir: &Path,
    run_id: Uuid,
    kind: &str,
    started_at: DateTime<Utc>,
    summary: &T,
) -> Result<PathBuf> {
    let dir = reports_dir.join(run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let report = RunReport {
        run_id,
        kind,
        started_at,
        finished_at: Utc::now(),
        summary,
    };
    let body = serde_json::to_vec_pretty(&report).context("serializing run report")?;
    let path = dir.join(format!("{kind}.json"));
    fs::write(&path, body)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Directory sync on the configured cron, or `None` when scheduled sync is disabled.
pub async fn maybe_build_scheduler(
    config: &AppConfig,
    sync: Arc<DirectorySync>,
) -> Result<Option<JobScheduler>> {
    if !config.sync_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let reports_dir = config.reports_dir.clone();
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let sync = Arc::clone(&sync);
        let reports_dir = reports_dir.clone();
        Box::pin(async move {
            let started_at = Utc::now();
            let run_id = Uuid::new_v4();
            match sync.run_once().await {
                Ok(summary) => {
                    if let Err(err) =
                        write_run_report(&reports_dir, run_id, "sync", started_at, &summary).await
                    {
                        warn!(error = %format!("{err:#}"), "could not write sync report");
                    }
                }
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scheduled directory sync");
    Ok(Some(sched))
}
