//! Year-partitioned Parquet store with atomic whole-partition replacement.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arrow_array::{Array, ArrayRef, Date32Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use chrono::{Datelike, NaiveDate};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression as ParquetCompression, ZstdLevel};
use parquet::file::metadata::ParquetMetaData;
use parquet::file::properties::WriterProperties;
use parquet::file::statistics::Statistics;
use propwatch_core::{
    Compression, ConfigError, IngestionOutcome, RawTransactionRow, StoreConfig, TransactionRecord,
};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::feed::{FeedError, FeedReader};
use crate::{StoreError, TransactionFilter, TransactionQuery};

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_CE_DAYS: i32 = 719_163;
const MAX_REPORTED_ERRORS: usize = 50;
const READ_BATCH_SIZE: usize = 8_192;
const TEMP_SUFFIX: &str = ".tmp";
/// Temp files younger than this may belong to a publish still in flight.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub year: i32,
    pub path: PathBuf,
    pub row_count: i64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct PartitionStore {
    config: StoreConfig,
}

impl PartitionStore {
    /// Validates the configuration and makes sure the root directory exists.
    pub fn open(config: StoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        fs::create_dir_all(&config.root).map_err(|err| ConfigError::UnusablePath {
            path: config.root.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self { config })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn partition_dir(&self, year: i32) -> PathBuf {
        self.config.root.join(format!("year={year}"))
    }

    pub fn partition_path(&self, year: i32) -> PathBuf {
        self.partition_dir(year).join(format!("ppd_{year}.parquet"))
    }

    /// Validate, sort and publish one year's rows, replacing any earlier partition for that year.
    ///
    /// Invalid rows are counted in the outcome and never raise. A batch with
    /// no valid rows leaves the existing partition untouched. Only a failure
    /// to publish is returned as an error, and in that case the previously
    /// published partition is still in place.
    pub fn ingest<I>(&self, rows: I, year: i32) -> Result<IngestionOutcome, StoreError>
    where
        I: IntoIterator<Item = Result<RawTransactionRow, FeedError>>,
    {
        let span = info_span!("ingest_partition", year);
        let _guard = span.enter();

        let mut outcome = IngestionOutcome {
            year,
            ..Default::default()
        };
        let mut valid = Vec::new();
        let mut off_year = 0usize;

        for (index, row) in rows.into_iter().enumerate() {
            let row_number = index + 1;
            let raw = match row {
                Ok(raw) => raw,
                Err(err) => {
                    note_failure(&mut outcome, format!("row {row_number}: {err}"));
                    continue;
                }
            };
            match TransactionRecord::try_from(raw) {
                Ok(record) => {
                    if record.transfer_date.year() != year {
                        off_year += 1;
                    }
                    valid.push(record);
                }
                Err(rejection) => {
                    note_failure(&mut outcome, format!("row {row_number}: {rejection}"));
                }
            }
        }

        if outcome.failed > 0 {
            warn!(failed = outcome.failed, "dropped invalid records");
            outcome.errors.push(format!(
                "{} records failed validation and were dropped",
                outcome.failed
            ));
        }
        if off_year > 0 {
            warn!(off_year, "records dated outside the partition year");
        }

        if valid.is_empty() {
            outcome
                .errors
                .push(format!("no valid records for {year}; existing partition left untouched"));
            return Ok(outcome);
        }

        valid.sort_by(|a, b| {
            a.transfer_date
                .cmp(&b.transfer_date)
                .then_with(|| a.postcode.cmp(&b.postcode))
        });

        let location = self.publish(year, &valid)?;
        outcome.successful = valid.len();
        outcome.location = Some(location.clone());
        info!(
            successful = outcome.successful,
            failed = outcome.failed,
            path = %location.display(),
            "published partition"
        );
        Ok(outcome)
    }

    /// Stream a headerless CSV feed into the partition for `year`.
    pub fn ingest_csv(&self, path: &Path, year: i32) -> Result<IngestionOutcome, StoreError> {
        info!(path = %path.display(), year, "starting feed ingestion");
        let reader = FeedReader::open(path)?;
        self.ingest(reader.rows(), year)
    }

    fn publish(&self, year: i32, rows: &[TransactionRecord]) -> Result<PathBuf, StoreError> {
        self.publish_to(year, rows, self.partition_path(year))
    }

    /// Write `rows` next to `final_path` and rename into place. The temp file
    /// never outlives a failed attempt.
    fn publish_to(
        &self,
        year: i32,
        rows: &[TransactionRecord],
        final_path: PathBuf,
    ) -> Result<PathBuf, StoreError> {
        let write_err = |reason: String| StoreError::Write { year, reason };

        let dir = self.partition_dir(year);
        fs::create_dir_all(&dir)
            .map_err(|err| write_err(format!("creating {}: {err}", dir.display())))?;

        let temp_path = dir.join(format!(".{}.parquet{TEMP_SUFFIX}", Uuid::new_v4()));

        let written = self.write_partition_file(&temp_path, rows);
        let result = written.and_then(|()| {
            fs::rename(&temp_path, &final_path).map_err(|err| {
                format!(
                    "renaming {} -> {}: {err}",
                    temp_path.display(),
                    final_path.display()
                )
            })
        });

        match result {
            Ok(()) => Ok(final_path),
            Err(reason) => {
                let _ = fs::remove_file(&temp_path);
                Err(write_err(reason))
            }
        }
    }

    fn write_partition_file(&self, path: &Path, rows: &[TransactionRecord]) -> Result<(), String> {
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .map_err(|err| format!("opening {}: {err}", path.display()))?;

        let props = WriterProperties::builder()
            .set_compression(parquet_codec(self.config.compression))
            .set_max_row_group_size(self.config.rows_per_group)
            .build();
        let mut writer = ArrowWriter::try_new(file, partition_schema(), Some(props))
            .map_err(|err| format!("opening parquet writer {}: {err}", path.display()))?;

        for chunk in rows.chunks(self.config.rows_per_group) {
            let batch = record_batch(chunk)
                .map_err(|err| format!("building record batch: {err}"))?;
            writer
                .write(&batch)
                .map_err(|err| format!("writing record batch {}: {err}", path.display()))?;
        }

        let file = writer
            .into_inner()
            .map_err(|err| format!("closing parquet writer {}: {err}", path.display()))?;
        file.sync_all()
            .map_err(|err| format!("syncing {}: {err}", path.display()))?;
        Ok(())
    }

    /// Published partitions, ordered by year.
    pub fn partitions(&self) -> Result<Vec<PartitionInfo>, StoreError> {
        let mut out = Vec::new();
        for (year, path) in self.partition_files()? {
            let file = File::open(&path)?;
            let bytes = file.metadata()?.len();
            let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|err| {
                StoreError::QueryFailed {
                    path: path.clone(),
                    reason: err.to_string(),
                }
            })?;
            let row_count = builder.metadata().file_metadata().num_rows();
            out.push(PartitionInfo {
                year,
                path,
                row_count,
                bytes,
            });
        }
        Ok(out)
    }

    /// Remove temp files left by interrupted publishes, sparing any younger
    /// than [`STALE_TEMP_AGE`]. Returns how many were removed.
    pub fn sweep_temp_files(&self) -> Result<usize, StoreError> {
        self.sweep_temp_files_older_than(STALE_TEMP_AGE)
    }

    pub fn sweep_temp_files_older_than(&self, min_age: Duration) -> Result<usize, StoreError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for dir in self.partition_dirs()? {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if !(name.starts_with('.') && name.ends_with(TEMP_SUFFIX)) {
                    continue;
                }
                // A modification time in the future reads as age zero.
                let age = now
                    .duration_since(entry.metadata()?.modified()?)
                    .unwrap_or_default();
                if age < min_age {
                    debug!(path = %entry.path().display(), "leaving recent temp file");
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if removed > 0 {
            warn!(removed, "removed stale partition temp files");
        }
        Ok(removed)
    }

    fn partition_dirs(&self) -> Result<Vec<PathBuf>, StoreError> {
        if !self.config.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.config.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() && partition_year(&entry.file_name().to_string_lossy()).is_some() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }

    fn partition_files(&self) -> Result<Vec<(i32, PathBuf)>, StoreError> {
        let mut files = Vec::new();
        for dir in self.partition_dirs()? {
            let Some(year) = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(partition_year)
            else {
                continue;
            };
            let path = self.partition_path(year);
            if path.is_file() {
                files.push((year, path));
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_partition(
        &self,
        path: &Path,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, String> {
        let file = File::open(path).map_err(|err| format!("opening: {err}"))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|err| format!("reading footer: {err}"))?;

        let row_groups = match filter.date_range {
            Some((from, to)) => {
                row_groups_in_range(builder.metadata(), to_epoch_days(from), to_epoch_days(to))
            }
            None => (0..builder.metadata().num_row_groups()).collect(),
        };
        if row_groups.is_empty() {
            return Ok(Vec::new());
        }

        let reader = builder
            .with_row_groups(row_groups)
            .with_batch_size(READ_BATCH_SIZE)
            .build()
            .map_err(|err| format!("building reader: {err}"))?;

        let mut out = Vec::new();
        for batch in reader {
            let batch = batch.map_err(|err| format!("decoding batch: {err}"))?;
            collect_matching(&batch, filter, &mut out)?;
        }
        Ok(out)
    }
}

impl TransactionQuery for PartitionStore {
    fn query(&self, filter: &TransactionFilter) -> Result<Vec<TransactionRecord>, StoreError> {
        if filter.is_unbounded() {
            debug!("unbounded transaction query");
        }
        let mut out = Vec::new();
        for (_year, path) in self.partition_files()? {
            let rows = self
                .read_partition(&path, filter)
                .map_err(|reason| StoreError::QueryFailed {
                    path: path.clone(),
                    reason,
                })?;
            out.extend(rows);
        }
        Ok(out)
    }
}

fn note_failure(outcome: &mut IngestionOutcome, message: String) {
    outcome.failed += 1;
    if outcome.errors.len() < MAX_REPORTED_ERRORS {
        outcome.errors.push(message);
    }
}

fn partition_year(dir_name: &str) -> Option<i32> {
    dir_name.strip_prefix("year=")?.parse().ok()
}

fn parquet_codec(compression: Compression) -> ParquetCompression {
    match compression {
        Compression::Snappy => ParquetCompression::SNAPPY,
        Compression::Zstd => ParquetCompression::ZSTD(ZstdLevel::default()),
        Compression::Uncompressed => ParquetCompression::UNCOMPRESSED,
    }
}

fn to_epoch_days(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_CE_DAYS
}

fn from_epoch_days(days: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(days.checked_add(UNIX_EPOCH_CE_DAYS)?)
}

fn row_groups_in_range(metadata: &ParquetMetaData, from: i32, to: i32) -> Vec<usize> {
    let column = metadata
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .position(|c| c.name() == "transfer_date");

    metadata
        .row_groups()
        .iter()
        .enumerate()
        .filter(|(_, group)| {
            let Some(column) = column else {
                return true;
            };
            match group.column(column).statistics() {
                Some(Statistics::Int32(stats)) => match (stats.min_opt(), stats.max_opt()) {
                    (Some(min), Some(max)) => *max >= from && *min <= to,
                    _ => true,
                },
                _ => true,
            }
        })
        .map(|(index, _)| index)
        .collect()
}

pub(crate) fn partition_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("transaction_id", DataType::Utf8, false),
        ArrowField::new("price", DataType::Int64, false),
        ArrowField::new("transfer_date", DataType::Date32, false),
        ArrowField::new("postcode", DataType::Utf8, true),
        ArrowField::new("property_type", DataType::Utf8, true),
        ArrowField::new("old_new", DataType::Utf8, true),
        ArrowField::new("duration", DataType::Utf8, true),
        ArrowField::new("paon", DataType::Utf8, true),
        ArrowField::new("saon", DataType::Utf8, true),
        ArrowField::new("street", DataType::Utf8, true),
        ArrowField::new("locality", DataType::Utf8, true),
        ArrowField::new("town", DataType::Utf8, true),
        ArrowField::new("district", DataType::Utf8, true),
        ArrowField::new("county", DataType::Utf8, true),
        ArrowField::new("ppd_category", DataType::Utf8, true),
        ArrowField::new("record_status", DataType::Utf8, true),
        ArrowField::new("full_address", DataType::Utf8, false),
        ArrowField::new("normalized_address", DataType::Utf8, false),
    ]))
}

fn optional_strings<'a>(
    rows: &'a [TransactionRecord],
    field: impl Fn(&'a TransactionRecord) -> Option<&'a str>,
) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(field).collect::<Vec<_>>()))
}

fn record_batch(rows: &[TransactionRecord]) -> Result<RecordBatch, arrow_schema::ArrowError> {
    let ids = StringArray::from(
        rows.iter()
            .map(|r| r.transaction_id.as_str())
            .collect::<Vec<_>>(),
    );
    let prices = Int64Array::from(rows.iter().map(|r| r.price).collect::<Vec<_>>());
    let dates = Date32Array::from(
        rows.iter()
            .map(|r| to_epoch_days(r.transfer_date))
            .collect::<Vec<_>>(),
    );
    let full = StringArray::from(rows.iter().map(|r| r.full_address.as_str()).collect::<Vec<_>>());
    let normalized = StringArray::from(
        rows.iter()
            .map(|r| r.normalized_address.as_str())
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        partition_schema(),
        vec![
            Arc::new(ids),
            Arc::new(prices),
            Arc::new(dates),
            optional_strings(rows, |r| r.postcode.as_deref()),
            optional_strings(rows, |r| r.property_type.as_deref()),
            optional_strings(rows, |r| r.old_new.as_deref()),
            optional_strings(rows, |r| r.duration.as_deref()),
            optional_strings(rows, |r| r.paon.as_deref()),
            optional_strings(rows, |r| r.saon.as_deref()),
            optional_strings(rows, |r| r.street.as_deref()),
            optional_strings(rows, |r| r.locality.as_deref()),
            optional_strings(rows, |r| r.town.as_deref()),
            optional_strings(rows, |r| r.district.as_deref()),
            optional_strings(rows, |r| r.county.as_deref()),
            optional_strings(rows, |r| r.ppd_category.as_deref()),
            optional_strings(rows, |r| r.record_status.as_deref()),
            Arc::new(full),
            Arc::new(normalized),
        ],
    )
}

fn typed_column<'b, T: 'static>(batch: &'b RecordBatch, name: &str) -> Result<&'b T, String> {
    batch
        .column_by_name(name)
        .ok_or_else(|| format!("missing column {name}"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| format!("column {name} has unexpected type"))
}

fn optional_value(column: &StringArray, row: usize) -> Option<String> {
    column.is_valid(row).then(|| column.value(row).to_string())
}

fn collect_matching(
    batch: &RecordBatch,
    filter: &TransactionFilter,
    out: &mut Vec<TransactionRecord>,
) -> Result<(), String> {
    let ids = typed_column::<StringArray>(batch, "transaction_id")?;
    let prices = typed_column::<Int64Array>(batch, "price")?;
    let dates = typed_column::<Date32Array>(batch, "transfer_date")?;
    let postcodes = typed_column::<StringArray>(batch, "postcode")?;
    let property_types = typed_column::<StringArray>(batch, "property_type")?;
    let old_new = typed_column::<StringArray>(batch, "old_new")?;
    let durations = typed_column::<StringArray>(batch, "duration")?;
    let paons = typed_column::<StringArray>(batch, "paon")?;
    let saons = typed_column::<StringArray>(batch, "saon")?;
    let streets = typed_column::<StringArray>(batch, "street")?;
    let localities = typed_column::<StringArray>(batch, "locality")?;
    let towns = typed_column::<StringArray>(batch, "town")?;
    let districts = typed_column::<StringArray>(batch, "district")?;
    let counties = typed_column::<StringArray>(batch, "county")?;
    let categories = typed_column::<StringArray>(batch, "ppd_category")?;
    let statuses = typed_column::<StringArray>(batch, "record_status")?;
    let full = typed_column::<StringArray>(batch, "full_address")?;
    let normalized = typed_column::<StringArray>(batch, "normalized_address")?;

    for row in 0..batch.num_rows() {
        let transfer_date = from_epoch_days(dates.value(row))
            .ok_or_else(|| format!("transfer_date out of range at row {row}"))?;
        if !filter.date_matches(transfer_date) {
            continue;
        }
        let postcode = optional_value(postcodes, row);
        if !filter.postcode_matches(postcode.as_deref()) {
            continue;
        }
        out.push(TransactionRecord {
            transaction_id: ids.value(row).to_string(),
            price: prices.value(row),
            transfer_date,
            postcode,
            property_type: optional_value(property_types, row),
            old_new: optional_value(old_new, row),
            duration: optional_value(durations, row),
            paon: optional_value(paons, row),
            saon: optional_value(saons, row),
            street: optional_value(streets, row),
            locality: optional_value(localities, row),
            town: optional_value(towns, row),
            district: optional_value(districts, row),
            county: optional_value(counties, row),
            ppd_category: optional_value(categories, row),
            record_status: optional_value(statuses, row),
            full_address: full.value(row).to_string(),
            normalized_address: normalized.value(row).to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw(id: &str, date: &str, postcode: &str, paon: &str, street: &str) -> RawTransactionRow {
        RawTransactionRow {
            transaction_id: Some(id.to_string()),
            price: Some("250000".to_string()),
            transfer_date: Some(date.to_string()),
            postcode: Some(postcode.to_string()),
            paon: Some(paon.to_string()),
            street: Some(street.to_string()),
            town: Some("LONDON".to_string()),
            ..Default::default()
        }
    }

    fn ok_rows(rows: Vec<RawTransactionRow>) -> impl Iterator<Item = Result<RawTransactionRow, FeedError>> {
        rows.into_iter().map(Ok)
    }

    fn store_in(dir: &Path) -> PartitionStore {
        PartitionStore::open(StoreConfig::new(dir)).expect("open store")
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn epoch_day_conversion_round_trips_known_dates() {
        assert_eq!(to_epoch_days(date(1970, 1, 1)), 0);
        assert_eq!(to_epoch_days(date(1970, 1, 2)), 1);
        assert_eq!(from_epoch_days(to_epoch_days(date(2025, 2, 20))), Some(date(2025, 2, 20)));
    }

    #[test]
    fn ingest_drops_invalid_rows_and_sorts_the_partition() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());

        let mut rows = (1..=10)
            .rev()
            .map(|day| raw(&format!("T{day}"), &format!("2025-03-{day:02}"), "E1 6AN", "1", "ARCH ROAD"))
            .collect::<Vec<_>>();
        let mut missing_date = raw("BAD", "", "E1 6AN", "1", "ARCH ROAD");
        missing_date.transfer_date = None;
        rows.insert(4, missing_date);

        let outcome = store.ingest(ok_rows(rows), 2025).expect("ingest");
        assert_eq!(outcome.successful, 10);
        assert_eq!(outcome.failed, 1);
        assert!(outcome.errors.iter().any(|e| e.contains("missing transfer date")));
        assert_eq!(outcome.location.as_deref(), Some(store.partition_path(2025).as_path()));

        let all = store
            .query(&TransactionFilter::new().with_prefix("E1"))
            .expect("query");
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].transfer_date <= w[1].transfer_date));
        assert!(all.iter().all(|r| r.transaction_id != "BAD"));
    }

    #[test]
    fn reingesting_a_year_replaces_the_partition() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());

        let first = vec![
            raw("A1", "2025-01-10", "E1 6AN", "1", "ARCH ROAD"),
            raw("A2", "2025-01-11", "E1 6AN", "2", "ARCH ROAD"),
        ];
        let second = vec![raw("B1", "2025-02-01", "E1 6AN", "3", "ARCH ROAD")];
        store.ingest(ok_rows(first), 2025).expect("first ingest");
        store.ingest(ok_rows(second.clone()), 2025).expect("second ingest");
        store.ingest(ok_rows(second), 2025).expect("third ingest");

        let rows = store
            .query(&TransactionFilter::new().with_prefix("E1"))
            .expect("query");
        assert_eq!(
            rows.iter().map(|r| r.transaction_id.as_str()).collect::<Vec<_>>(),
            vec!["B1"]
        );
        assert_eq!(store.sweep_temp_files().expect("sweep"), 0);
    }

    #[test]
    fn batch_without_valid_rows_keeps_previous_partition() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        store
            .ingest(ok_rows(vec![raw("A1", "2025-01-10", "E1 6AN", "1", "ARCH ROAD")]), 2025)
            .expect("seed");

        let mut broken = raw("", "2025-01-10", "E1 6AN", "1", "ARCH ROAD");
        broken.transaction_id = None;
        let outcome = store.ingest(ok_rows(vec![broken]), 2025).expect("ingest");
        assert_eq!(outcome.successful, 0);
        assert!(!outcome.published());

        let rows = store.query(&TransactionFilter::new()).expect("query");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn feed_errors_count_as_failures() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let rows = vec![
            Ok(raw("A1", "2025-01-10", "E1 6AN", "1", "ARCH ROAD")),
            Err(FeedError::Malformed {
                line: 2,
                reason: "expected 16 columns, found 3".to_string(),
            }),
        ];
        let outcome = store.ingest(rows, 2025).expect("ingest");
        assert_eq!((outcome.successful, outcome.failed), (1, 1));
        assert!(outcome.errors[0].contains("line 2"));
    }

    #[test]
    fn query_filters_by_date_range_and_prefix_across_partitions() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::open(StoreConfig {
            root: dir.path().to_path_buf(),
            compression: Compression::Zstd,
            rows_per_group: 2,
        })
        .expect("open");

        store
            .ingest(
                ok_rows(vec![
                    raw("Y24-1", "2024-12-30", "SW1A 1AA", "1", "HIGH STREET"),
                    raw("Y24-2", "2024-06-01", "SW1A 2BB", "2", "HIGH STREET"),
                ]),
                2024,
            )
            .expect("2024");
        store
            .ingest(
                ok_rows(vec![
                    raw("Y25-1", "2025-01-05", "SW1A 1AA", "3", "HIGH STREET"),
                    raw("Y25-2", "2025-01-06", "E1 6AN", "4", "ARCH ROAD"),
                    raw("Y25-3", "2025-05-06", "SW1A 1AA", "5", "HIGH STREET"),
                    raw("Y25-4", "2025-09-06", "SW1A 1AA", "6", "HIGH STREET"),
                ]),
                2025,
            )
            .expect("2025");

        let filter = TransactionFilter::new()
            .between(date(2024, 12, 1), date(2025, 5, 6))
            .with_prefix("SW1A");
        let mut ids = store
            .query(&filter)
            .expect("query")
            .into_iter()
            .map(|r| r.transaction_id)
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, vec!["Y24-1", "Y25-1", "Y25-3"]);

        let partitions = store.partitions().expect("partitions");
        assert_eq!(
            partitions.iter().map(|p| (p.year, p.row_count)).collect::<Vec<_>>(),
            vec![(2024, 2), (2025, 4)]
        );
    }

    #[test]
    fn row_group_pruning_skips_out_of_range_groups() {
        let dir = tempdir().expect("tempdir");
        let store = PartitionStore::open(StoreConfig {
            root: dir.path().to_path_buf(),
            compression: Compression::Snappy,
            rows_per_group: 1,
        })
        .expect("open");
        store
            .ingest(
                ok_rows(vec![
                    raw("A", "2025-01-01", "E1 6AN", "1", "ARCH ROAD"),
                    raw("B", "2025-06-01", "E1 6AN", "2", "ARCH ROAD"),
                    raw("C", "2025-12-01", "E1 6AN", "3", "ARCH ROAD"),
                ]),
                2025,
            )
            .expect("ingest");

        let file = File::open(store.partition_path(2025)).expect("open partition");
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).expect("builder");
        assert_eq!(builder.metadata().num_row_groups(), 3);
        let kept = row_groups_in_range(
            builder.metadata(),
            to_epoch_days(date(2025, 5, 1)),
            to_epoch_days(date(2025, 7, 1)),
        );
        assert_eq!(kept, vec![1]);
    }

    #[test]
    fn corrupt_partition_fails_only_the_query() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let path = store.partition_path(2023);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"not parquet at all").unwrap();

        let err = store
            .query(&TransactionFilter::new().with_prefix("E1"))
            .expect_err("corrupt partition");
        assert!(matches!(err, StoreError::QueryFailed { .. }));
    }

    fn temp_files_in(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(TEMP_SUFFIX))
            .collect()
    }

    #[test]
    fn sweep_removes_stale_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let year_dir = store.partition_dir(2025);
        fs::create_dir_all(&year_dir).unwrap();
        let stale = year_dir.join(".abc.parquet.tmp");
        fs::write(&stale, b"partial").unwrap();
        File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - STALE_TEMP_AGE - Duration::from_secs(60))
            .unwrap();
        fs::write(year_dir.join("notes.txt"), b"keep").unwrap();

        assert_eq!(store.sweep_temp_files().expect("sweep"), 1);
        assert!(!stale.exists());
        assert!(year_dir.join("notes.txt").exists());
    }

    #[test]
    fn fresh_temp_file_survives_a_sweep() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let year_dir = store.partition_dir(2025);
        fs::create_dir_all(&year_dir).unwrap();
        let in_flight = year_dir.join(format!(".{}.parquet{TEMP_SUFFIX}", Uuid::new_v4()));
        fs::write(&in_flight, b"being written").unwrap();

        assert_eq!(store.sweep_temp_files().expect("sweep"), 0);
        assert!(in_flight.exists());

        assert_eq!(store.sweep_temp_files_older_than(Duration::ZERO).expect("sweep"), 1);
        assert!(!in_flight.exists());
    }

    #[test]
    fn failed_publish_keeps_the_previous_partition() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        store
            .ingest(
                ok_rows(vec![
                    raw("A1", "2025-01-10", "E1 6AN", "1", "ARCH ROAD"),
                    raw("A2", "2025-01-11", "E1 6AN", "2", "ARCH ROAD"),
                ]),
                2025,
            )
            .expect("seed");

        // A non-empty directory where the file should land makes the rename fail.
        let year_dir = store.partition_dir(2025);
        let blocked = year_dir.join("blocked.parquet");
        fs::create_dir_all(blocked.join("occupied")).unwrap();
        let replacement = vec![TransactionRecord::try_from(raw("B1", "2025-02-01", "E1 6AN", "3", "ARCH ROAD"))
            .expect("valid row")];

        let err = store
            .publish_to(2025, &replacement, blocked)
            .expect_err("rename onto a directory");
        assert!(matches!(err, StoreError::Write { year: 2025, .. }));

        let rows = store
            .query(&TransactionFilter::new().with_prefix("E1"))
            .expect("query");
        assert_eq!(
            rows.iter().map(|r| r.transaction_id.as_str()).collect::<Vec<_>>(),
            vec!["A1", "A2"]
        );
        assert!(temp_files_in(&year_dir).is_empty());
    }

    #[test]
    fn unusable_root_is_a_config_error() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let err = PartitionStore::open(StoreConfig::new(blocker.join("ppd"))).unwrap_err();
        assert!(matches!(err, ConfigError::UnusablePath { .. }));
    }

    #[test]
    fn ingest_csv_streams_a_feed_file() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir.path().join("ppd"));
        let feed = dir.path().join("pp-2025.csv");
        fs::write(
            &feed,
            "\"T1\",\"450000\",\"2025-02-20 00:00\",\"SW1A 1AA\",\"T\",\"N\",\"F\",\"123\",\"\",\"HIGH STREET\",\"\",\"LONDON\",\"WESTMINSTER\",\"GREATER LONDON\",\"A\",\"A\"\n",
        )
        .unwrap();

        let outcome = store.ingest_csv(&feed, 2025).expect("ingest");
        assert_eq!(outcome.successful, 1);
        let rows = store
            .query(&TransactionFilter::new().with_prefix("SW1A"))
            .expect("query");
        assert_eq!(rows[0].normalized_address, "123 HIGH STREET LONDON SW1A 1AA");
        assert_eq!(rows[0].full_address, "123, HIGH STREET, LONDON, SW1A 1AA");
    }
}
