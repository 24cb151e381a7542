//! Single-file upload jobs.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::FeedIngestor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadJob {
    pub id: Uuid,
    pub filename: String,
    pub csv_path: PathBuf,
    pub year: i32,
    pub month: Option<u32>,
    pub status: UploadStatus,
    pub records_processed: usize,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl UploadJob {
    pub fn new(csv_path: impl Into<PathBuf>, year: i32, month: Option<u32>) -> Self {
        let csv_path = csv_path.into();
        let filename = csv_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            filename,
            csv_path,
            year,
            month,
            status: UploadStatus::Pending,
            records_processed: 0,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    fn finish(&mut self, status: UploadStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.processed_at = Some(Utc::now());
    }
}

pub struct UploadProcessor {
    ingestor: FeedIngestor,
}

impl UploadProcessor {
    pub fn new(ingestor: FeedIngestor) -> Self {
        Self { ingestor }
    }

    /// Drive a pending job to `completed` or `failed`. Jobs in any other state are returned untouched.
    #[instrument(skip_all, fields(upload_id = %job.id, filename = %job.filename))]
    pub async fn process(&self, mut job: UploadJob) -> UploadJob {
        if job.status != UploadStatus::Pending {
            warn!(status = %job.status, "upload job is not pending; leaving it alone");
            return job;
        }
        job.status = UploadStatus::Processing;
        info!(year = job.year, month = ?job.month, "processing upload");

        let result = self
            .ingestor
            .ingest_file(&job.filename, &job.csv_path, job.year, job.month)
            .await;
        match result {
            Ok(outcome) if outcome.published() => {
                job.records_processed = outcome.successful;
                job.finish(UploadStatus::Completed, None);
                info!(rows = outcome.successful, failed = outcome.failed, "upload completed");
            }
            Ok(outcome) => {
                let message = if outcome.errors.is_empty() {
                    "feed contained no rows".to_string()
                } else {
                    outcome.errors.join("; ")
                };
                error!(error = %message, "upload produced no valid rows");
                job.finish(UploadStatus::Failed, Some(message));
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(error = %message, "upload failed");
                job.finish(UploadStatus::Failed, Some(message));
            }
        }
        job
    }
}
