//! Ingestion history: which source files have already been absorbed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use propwatch_core::IngestionRecord;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::StoreError;

/// History keyed by unique source filename.
///
/// This is an optimisation for orchestrators; the store's overwrite-by-year
/// semantics stay the source of truth, so a lost race here costs at most a
/// repeated ingestion of the same file.
#[async_trait]
pub trait IngestionTracker: Send + Sync {
    async fn has_ingested(&self, filename: &str) -> Result<bool, StoreError> {
        Ok(self.lookup(filename).await?.is_some())
    }

    async fn lookup(&self, filename: &str) -> Result<Option<IngestionRecord>, StoreError>;

    /// Returns `false` when the filename was already recorded.
    async fn record(&self, record: IngestionRecord) -> Result<bool, StoreError>;

    async fn history(&self) -> Result<Vec<IngestionRecord>, StoreError>;
}

pub fn ensure_recordable(record: &IngestionRecord) -> Result<(), StoreError> {
    if record.row_count == 0 {
        return Err(StoreError::Tracker(format!(
            "refusing to record {} with zero rows written",
            record.source_filename
        )));
    }
    if record.source_filename.trim().is_empty() {
        return Err(StoreError::Tracker("source filename is empty".to_string()));
    }
    Ok(())
}

/// Append-only JSON-lines history file.
#[derive(Debug)]
pub struct JsonlIngestionTracker {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl JsonlIngestionTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    /// Default history location inside a store root.
    pub fn in_store_root(root: &Path) -> Self {
        Self::new(root.join("_ingest_history.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<IngestionRecord>, StoreError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<IngestionRecord>(line) {
                Ok(record) => {
                    if seen.insert(record.source_filename.clone()) {
                        out.push(record);
                    }
                }
                Err(err) => {
                    warn!(line = index + 1, error = %err, path = %self.path.display(), "skipping unreadable history line");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl IngestionTracker for JsonlIngestionTracker {
    async fn lookup(&self, filename: &str) -> Result<Option<IngestionRecord>, StoreError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|r| r.source_filename == filename))
    }

    async fn record(&self, record: IngestionRecord) -> Result<bool, StoreError> {
        ensure_recordable(&record)?;
        let _guard = self.append_lock.lock().await;

        if self.lookup(&record.source_filename).await?.is_some() {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&record)
            .map_err(|err| StoreError::Tracker(format!("serializing history record: {err}")))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        info!(
            filename = %record.source_filename,
            year = record.year,
            rows = record.row_count,
            "recorded ingestion"
        );
        Ok(true)
    }

    async fn history(&self) -> Result<Vec<IngestionRecord>, StoreError> {
        self.read_all().await
    }
}

/// Streaming SHA-256 of a file, hex encoded.
pub async fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
