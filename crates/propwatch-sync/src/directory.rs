//! Scan a drop directory for feed files and absorb the ones not seen before.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, instrument, warn};

use crate::FeedIngestor;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySyncSummary {
    pub total_files_found: usize,
    pub already_ingested: usize,
    pub newly_ingested: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

const PERIOD_PATTERNS: [&str; 4] = [
    r"(?i)pp-(\d{4})(?:-(\d{1,2}))?\.csv",
    r"(?i)pp-monthly-update-(\d{4})-(\d{1,2})\.csv",
    r"(\d{4})-(\d{1,2})",
    r"(\d{4})",
];

/// Filename period patterns, most specific first.
static PERIOD_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    PERIOD_PATTERNS
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(err) => {
                error!(pattern = *pattern, error = %err, "invalid filename period pattern");
                None
            }
        })
        .collect()
});

/// Year and optional month encoded in a feed filename.
///
/// Recognises `pp-2025.csv`, `pp-2025-01.csv`, `pp-monthly-update-2025-01.csv`
/// and falls back to any embedded `YYYY-MM` or `YYYY`.
pub fn extract_year_month(filename: &str) -> Option<(i32, Option<u32>)> {
    let caps = PERIOD_REGEXES.iter().find_map(|re| re.captures(filename))?;
    let year = caps.get(1)?.as_str().parse::<i32>().ok()?;
    let month = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .filter(|m| (1..=12).contains(m));
    Some((year, month))
}

pub struct DirectorySync {
    ingestor: FeedIngestor,
    csv_dir: PathBuf,
}

impl DirectorySync {
    pub fn new(ingestor: FeedIngestor, csv_dir: impl Into<PathBuf>) -> Self {
        Self {
            ingestor,
            csv_dir: csv_dir.into(),
        }
    }

    pub fn csv_dir(&self) -> &Path {
        &self.csv_dir
    }

    /// One pass over the directory. Per-file problems are counted in the
    /// summary; only an unreadable directory or history fails the run.
    #[instrument(skip_all, fields(dir = %self.csv_dir.display()))]
    pub async fn run_once(&self) -> Result<DirectorySyncSummary> {
        let mut summary = DirectorySyncSummary::default();

        if fs::metadata(&self.csv_dir).await.is_err() {
            warn!("feed directory missing; creating it");
            fs::create_dir_all(&self.csv_dir)
                .await
                .with_context(|| format!("creating {}", self.csv_dir.display()))?;
            return Ok(summary);
        }

        self.ingestor.sweep_temp_files().await?;

        let files = self.feed_files().await?;
        summary.total_files_found = files.len();
        if files.is_empty() {
            info!("no feed files found");
            return Ok(summary);
        }

        for (filename, path) in files {
            if self
                .ingestor
                .tracker()
                .has_ingested(&filename)
                .await
                .context("reading ingestion history")?
            {
                info!(filename = %filename, "already ingested; skipping");
                summary.already_ingested += 1;
                continue;
            }

            let Some((year, month)) = extract_year_month(&filename) else {
                let message = format!("could not extract year/month from filename: {filename}");
                warn!("{message}");
                summary.errors.push(message);
                summary.failed += 1;
                continue;
            };

            match self.ingestor.ingest_file(&filename, &path, year, month).await {
                Ok(outcome) if outcome.published() => {
                    info!(filename = %filename, rows = outcome.successful, "ingested feed file");
                    summary.newly_ingested += 1;
                }
                Ok(outcome) => {
                    let message = format!(
                        "failed to ingest {filename}: {}",
                        outcome.errors.join(", ")
                    );
                    error!("{message}");
                    summary.errors.push(message);
                    summary.failed += 1;
                }
                Err(err) => {
                    let message = format!("error ingesting {filename}: {err:#}");
                    error!("{message}");
                    summary.errors.push(message);
                    summary.failed += 1;
                }
            }
        }

        info!(
            found = summary.total_files_found,
            skipped = summary.already_ingested,
            ingested = summary.newly_ingested,
            failed = summary.failed,
            "directory sync complete"
        );
        Ok(summary)
    }

    async fn feed_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = fs::read_dir(&self.csv_dir)
            .await
            .with_context(|| format!("reading {}", self.csv_dir.display()))?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_csv = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if !is_csv || !entry.file_type().await?.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().to_string();
            files.push((filename, path));
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_patterns_all_compile() {
        assert_eq!(PERIOD_REGEXES.len(), PERIOD_PATTERNS.len());
    }

    #[test]
    fn filename_periods() {
        assert_eq!(extract_year_month("pp-2025.csv"), Some((2025, None)));
        assert_eq!(extract_year_month("pp-2025-01.csv"), Some((2025, Some(1))));
        assert_eq!(extract_year_month("PP-2024-11.CSV"), Some((2024, Some(11))));
        assert_eq!(
            extract_year_month("pp-monthly-update-2025-03.csv"),
            Some((2025, Some(3)))
        );
        assert_eq!(extract_year_month("land-registry-2023-07-export.csv"), Some((2023, Some(7))));
        assert_eq!(extract_year_month("export_2022.csv"), Some((2022, None)));
        assert_eq!(extract_year_month("pp-2025-13.csv"), Some((2025, None)));
        assert_eq!(extract_year_month("latest.csv"), None);
    }
}
