//! Headerless fixed-column transaction feed reader.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use propwatch_core::RawTransactionRow;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("opening feed {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {reason}")]
    Malformed { line: u64, reason: String },
}

/// Streams raw rows one record at a time; nothing beyond the current record is buffered.
pub struct FeedReader<R: Read> {
    inner: csv::Reader<R>,
}

impl FeedReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, FeedError> {
        let file = File::open(path).map_err(|source| FeedError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: Read> FeedReader<R> {
    pub fn from_reader(reader: R) -> Self {
        let inner = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        Self { inner }
    }

    pub fn rows(self) -> impl Iterator<Item = Result<RawTransactionRow, FeedError>> {
        self.inner.into_records().map(|result| {
            let record = result.map_err(|err| FeedError::Malformed {
                line: err.position().map(|p| p.line()).unwrap_or(0),
                reason: err.to_string(),
            })?;
            RawTransactionRow::from_fields(record.iter()).map_err(|rejection| FeedError::Malformed {
                line: record.position().map(|p| p.line()).unwrap_or(0),
                reason: rejection.to_string(),
            })
        })
    }
}
