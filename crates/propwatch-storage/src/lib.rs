//! Partitioned transaction storage, feed reading and ingestion history for propwatch.

use std::path::PathBuf;

use chrono::NaiveDate;
use propwatch_core::{ConfigError, TransactionRecord};
use thiserror::Error;

pub mod feed;
pub mod memory;
pub mod partition;
pub mod tracker;

pub use feed::{FeedError, FeedReader};
pub use memory::InMemoryTransactionIndex;
pub use partition::{PartitionInfo, PartitionStore, STALE_TEMP_AGE};
pub use tracker::{ensure_recordable, file_sha256, IngestionTracker, JsonlIngestionTracker};

pub const CRATE_NAME: &str = "propwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to publish partition for {year}: {reason}")]
    Write { year: i32, reason: String },
    #[error("query failed on {path}: {reason}")]
    QueryFailed { path: PathBuf, reason: String },
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("ingestion tracker failure: {0}")]
    Tracker(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Range + prefix selection over stored transactions.
///
/// An empty filter selects everything; callers are expected to always bound
/// at least one side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub date_range: Option<(NaiveDate, NaiveDate)>,
    pub postcode_prefixes: Vec<String>,
}

impl TransactionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inclusive on both ends.
    pub fn between(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.date_range = Some((from.min(to), from.max(to)));
        self
    }

    pub fn with_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        let prefix = prefix.as_ref().trim().to_uppercase();
        if !prefix.is_empty() && !self.postcode_prefixes.contains(&prefix) {
            self.postcode_prefixes.push(prefix);
        }
        self
    }

    pub fn is_unbounded(&self) -> bool {
        self.date_range.is_none() && self.postcode_prefixes.is_empty()
    }

    pub fn date_matches(&self, date: NaiveDate) -> bool {
        match self.date_range {
            Some((from, to)) => date >= from && date <= to,
            None => true,
        }
    }

    pub fn postcode_matches(&self, postcode: Option<&str>) -> bool {
        if self.postcode_prefixes.is_empty() {
            return true;
        }
        let Some(postcode) = postcode else {
            return false;
        };
        let postcode = postcode.trim().to_uppercase();
        self.postcode_prefixes
            .iter()
            .any(|prefix| postcode.starts_with(prefix.as_str()))
    }

    pub fn matches(&self, record: &TransactionRecord) -> bool {
        self.date_matches(record.transfer_date) && self.postcode_matches(record.postcode.as_deref())
    }
}

/// Read-only candidate selection. Implementations must be safe to call from
/// many threads at once.
pub trait TransactionQuery: Send + Sync {
    fn query(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>, StoreError>;
}
