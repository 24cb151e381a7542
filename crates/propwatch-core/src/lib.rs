//! Core domain model, configuration values and address helpers for propwatch.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod address;

pub const CRATE_NAME: &str = "propwatch-core";

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("scoring weights must sum to 1 (got {sum:.6})")]
    WeightSum { sum: f64 },
    #[error("{name} must be within {min}..={max} (got {value})")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("min confidence threshold {min} exceeds high confidence threshold {high}")]
    ThresholdOrder { min: f64, high: f64 },
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("storage path {path} is unusable: {reason}")]
    UnusablePath { path: PathBuf, reason: String },
}

/// Parquet codec applied to partition files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Snappy,
    Zstd,
    Uncompressed,
}

impl FromStr for Compression {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(Self::Snappy),
            "zstd" => Ok(Self::Zstd),
            "none" | "uncompressed" => Ok(Self::Uncompressed),
            other => Err(ConfigError::InvalidValue {
                key: "compression".to_string(),
                value: other.to_string(),
                reason: "expected snappy, zstd or uncompressed".to_string(),
            }),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Snappy => "snappy",
            Self::Zstd => "zstd",
            Self::Uncompressed => "uncompressed",
        };
        f.write_str(name)
    }
}

/// Relative weight of each confidence component. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub address: f64,
    pub date: f64,
    pub postcode: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            address: 0.70,
            date: 0.20,
            postcode: 0.10,
        }
    }
}

impl ScoringWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("address weight", self.address),
            ("date weight", self.date),
            ("postcode weight", self.postcode),
        ] {
            check_range(name, value, 0.0, 1.0)?;
        }
        let sum = self.address + self.date + self.postcode;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightSum { sum });
        }
        Ok(())
    }

    /// Weighted composite of three 0..=100 component scores, rounded to two decimals.
    pub fn combine(&self, address_similarity: f64, date_proximity: f64, postcode_exact: f64) -> f64 {
        let raw = address_similarity * self.address
            + date_proximity * self.date
            + postcode_exact * self.postcode;
        address::round2(raw.clamp(0.0, 100.0))
    }
}

/// Immutable matching configuration handed to the engine at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub scan_window_months: u32,
    pub min_confidence_threshold: f64,
    pub high_confidence_threshold: f64,
    pub min_address_similarity: f64,
    pub weights: ScoringWeights,
    pub max_concurrent_listings: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scan_window_months: 24,
            min_confidence_threshold: 70.0,
            high_confidence_threshold: 85.0,
            min_address_similarity: 80.0,
            weights: ScoringWeights::default(),
            max_concurrent_listings: 8,
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()?;
        if self.scan_window_months == 0 {
            return Err(ConfigError::OutOfRange {
                name: "scan window months",
                value: 0.0,
                min: 1.0,
                max: f64::from(u32::MAX),
            });
        }
        check_range("min confidence threshold", self.min_confidence_threshold, 0.0, 100.0)?;
        check_range("high confidence threshold", self.high_confidence_threshold, 0.0, 100.0)?;
        check_range("min address similarity", self.min_address_similarity, 0.0, 100.0)?;
        if self.min_confidence_threshold > self.high_confidence_threshold {
            return Err(ConfigError::ThresholdOrder {
                min: self.min_confidence_threshold,
                high: self.high_confidence_threshold,
            });
        }
        if self.max_concurrent_listings == 0 {
            return Err(ConfigError::OutOfRange {
                name: "max concurrent listings",
                value: 0.0,
                min: 1.0,
                max: f64::from(u32::MAX),
            });
        }
        Ok(())
    }

    /// Scan window expressed in days (months are counted as 30 days).
    pub fn scan_window_days(&self) -> i64 {
        i64::from(self.scan_window_months) * 30
    }

    /// 100 for the same day, falling linearly to 0 at the edge of the scan window.
    /// Returns 0 when either date is unknown.
    pub fn date_proximity_score(
        &self,
        withdrawal_date: Option<NaiveDate>,
        transfer_date: Option<NaiveDate>,
    ) -> f64 {
        let (Some(withdrawn), Some(transferred)) = (withdrawal_date, transfer_date) else {
            return 0.0;
        };
        let days = (transferred - withdrawn).num_days().abs() as f64;
        let window = self.scan_window_days() as f64;
        (100.0 - days / window * 100.0).max(0.0)
    }
}

fn check_range(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if value.is_nan() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Location and write settings for the partitioned transaction store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub compression: Compression,
    pub rows_per_group: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/ppd"),
            compression: Compression::Snappy,
            rows_per_group: 65_536,
        }
    }
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rows_per_group == 0 {
            return Err(ConfigError::OutOfRange {
                name: "rows per group",
                value: 0.0,
                min: 1.0,
                max: f64::from(u32::MAX),
            });
        }
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::UnusablePath {
                path: self.root.clone(),
                reason: "path is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Uppercased postcode with all whitespace removed.
pub fn compact_postcode(postcode: &str) -> String {
    postcode
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// `SW1A1AA` -> `SW1A 1AA`. Input that is too short or not ASCII alphanumeric is returned compacted.
pub fn format_postcode(postcode: &str) -> String {
    let compact = compact_postcode(postcode);
    if compact.len() >= 5 && compact.chars().all(|c| c.is_ascii_alphanumeric()) {
        let split = compact.len() - 3;
        format!("{} {}", &compact[..split], &compact[split..])
    } else {
        compact
    }
}

/// Outward prefix used for candidate selection: the token before the first
/// space, or the first four characters when there is no space.
pub fn postcode_prefix(postcode: &str) -> Option<String> {
    let trimmed = postcode.trim().to_uppercase();
    if trimmed.is_empty() {
        return None;
    }
    let prefix = match trimmed.split_once(char::is_whitespace) {
        Some((head, _)) => head.to_string(),
        None => trimmed.chars().take(4).collect(),
    };
    Some(prefix)
}

/// True when both postcodes are present and equal after compaction.
pub fn postcodes_match(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.map(compact_postcode), b.map(compact_postcode)) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

/// Why a feed row was refused at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowRejection {
    #[error("missing transaction identifier")]
    MissingIdentifier,
    #[error("missing transfer date")]
    MissingTransferDate,
    #[error("unparseable transfer date {0:?}")]
    InvalidDate(String),
    #[error("missing or non-integer price {0:?}")]
    InvalidPrice(String),
    #[error("empty address")]
    EmptyAddress,
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },
}

/// One unvalidated feed row in fixed column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTransactionRow {
    pub transaction_id: Option<String>,
    pub price: Option<String>,
    pub transfer_date: Option<String>,
    pub postcode: Option<String>,
    pub property_type: Option<String>,
    pub old_new: Option<String>,
    pub duration: Option<String>,
    pub paon: Option<String>,
    pub saon: Option<String>,
    pub street: Option<String>,
    pub locality: Option<String>,
    pub town: Option<String>,
    pub district: Option<String>,
    pub county: Option<String>,
    pub ppd_category: Option<String>,
    pub record_status: Option<String>,
}

impl RawTransactionRow {
    pub const COLUMN_COUNT: usize = 16;

    /// Build from positional fields; blank strings become `None`.
    pub fn from_fields<'a, I>(fields: I) -> Result<Self, RowRejection>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let values = fields.into_iter().map(non_blank).collect::<Vec<_>>();
        if values.len() != Self::COLUMN_COUNT {
            return Err(RowRejection::ColumnCount {
                expected: Self::COLUMN_COUNT,
                found: values.len(),
            });
        }
        let mut it = values.into_iter();
        let mut next = || it.next().flatten();
        Ok(Self {
            transaction_id: next(),
            price: next(),
            transfer_date: next(),
            postcode: next(),
            property_type: next(),
            old_new: next(),
            duration: next(),
            paon: next(),
            saon: next(),
            street: next(),
            locality: next(),
            town: next(),
            district: next(),
            county: next(),
            ppd_category: next(),
            record_status: next(),
        })
    }

    fn street_address(&self) -> String {
        [&self.saon, &self.paon, &self.street, &self.locality, &self.town]
            .into_iter()
            .filter_map(|c| c.as_deref())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Address components joined for display, postcode last.
    pub fn full_address(&self) -> String {
        let street = self.street_address();
        match (street.is_empty(), self.postcode.as_deref()) {
            (true, _) => String::new(),
            (false, Some(pc)) => format!("{street}, {pc}"),
            (false, None) => street,
        }
    }
}

fn non_blank(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]` and `DD/MM/YYYY`.
pub fn parse_feed_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if let Some(head) = trimmed.get(..10) {
        if let Ok(date) = NaiveDate::parse_from_str(head, "%Y-%m-%d") {
            return Some(date);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%d/%m/%Y").ok()
}

/// A validated completed sale as persisted in a partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_id: String,
    pub price: i64,
    pub transfer_date: NaiveDate,
    pub postcode: Option<String>,
    pub property_type: Option<String>,
    pub old_new: Option<String>,
    pub duration: Option<String>,
    pub paon: Option<String>,
    pub saon: Option<String>,
    pub street: Option<String>,
    pub locality: Option<String>,
    pub town: Option<String>,
    pub district: Option<String>,
    pub county: Option<String>,
    pub ppd_category: Option<String>,
    pub record_status: Option<String>,
    pub full_address: String,
    pub normalized_address: String,
}

impl TryFrom<RawTransactionRow> for TransactionRecord {
    type Error = RowRejection;

    fn try_from(raw: RawTransactionRow) -> Result<Self, Self::Error> {
        let transaction_id = raw
            .transaction_id
            .clone()
            .ok_or(RowRejection::MissingIdentifier)?;
        let date_text = raw
            .transfer_date
            .as_deref()
            .ok_or(RowRejection::MissingTransferDate)?;
        let transfer_date =
            parse_feed_date(date_text).ok_or_else(|| RowRejection::InvalidDate(date_text.to_string()))?;
        let full_address = raw.full_address();
        if full_address.is_empty() {
            return Err(RowRejection::EmptyAddress);
        }
        let price_text = raw.price.as_deref().unwrap_or_default();
        let price = price_text
            .parse::<i64>()
            .map_err(|_| RowRejection::InvalidPrice(price_text.to_string()))?;
        let normalized_address = address::normalize(&raw.street_address(), raw.postcode.as_deref());

        Ok(Self {
            transaction_id,
            price,
            transfer_date,
            postcode: raw.postcode,
            property_type: raw.property_type,
            old_new: raw.old_new,
            duration: raw.duration,
            paon: raw.paon,
            saon: raw.saon,
            street: raw.street,
            locality: raw.locality,
            town: raw.town,
            district: raw.district,
            county: raw.county,
            ppd_category: raw.ppd_category,
            record_status: raw.record_status,
            full_address,
            normalized_address,
        })
    }
}

/// Result of one `ingest` call. Row-level failures are counted, not raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionOutcome {
    pub year: i32,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub location: Option<PathBuf>,
}

impl IngestionOutcome {
    pub fn published(&self) -> bool {
        self.successful > 0 && self.location.is_some()
    }
}

/// History entry for one absorbed source file. Unique on `source_filename`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub source_filename: String,
    pub source_path: Option<PathBuf>,
    pub location: PathBuf,
    pub year: i32,
    pub month: Option<u32>,
    pub row_count: usize,
    pub content_sha256: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Withdrawn,
    Active,
    Sold,
    #[serde(other)]
    Other,
}

/// Agency-reported listing. Read-only input to detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub agency_id: String,
    pub address: String,
    #[serde(default)]
    pub normalized_address: Option<String>,
    #[serde(default)]
    pub postcode: Option<String>,
    #[serde(default)]
    pub withdrawal_date: Option<NaiveDate>,
    pub status: ListingStatus,
}

impl Listing {
    pub fn is_withdrawn(&self) -> bool {
        self.status == ListingStatus::Withdrawn
    }

    /// Stored canonical form when present, otherwise normalised on demand.
    pub fn canonical_address(&self) -> String {
        match self.normalized_address.as_deref().map(str::trim) {
            Some(existing) if !existing.is_empty() => existing.to_string(),
            _ => address::normalize(&self.address, self.postcode.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Suspicious,
    ConfirmedFraud,
    NotFraud,
    Error,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspicious => "suspicious",
            Self::ConfirmedFraud => "confirmed_fraud",
            Self::NotFraud => "not_fraud",
            Self::Error => "error",
        }
    }

    /// Only the external verification stage moves a match, and only out of `suspicious`.
    pub fn can_transition_to(&self, next: VerificationStatus) -> bool {
        matches!(
            (self, next),
            (
                Self::Suspicious,
                Self::ConfirmedFraud | Self::NotFraud | Self::Error
            )
        )
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationStatus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suspicious" => Ok(Self::Suspicious),
            "confirmed_fraud" => Ok(Self::ConfirmedFraud),
            "not_fraud" => Ok(Self::NotFraud),
            "error" => Ok(Self::Error),
            other => Err(ConfigError::InvalidValue {
                key: "verification_status".to_string(),
                value: other.to_string(),
                reason: "expected suspicious, confirmed_fraud, not_fraud or error".to_string(),
            }),
        }
    }
}

/// Scored listing/transaction pairing produced by detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub listing_id: String,
    pub agency_id: String,
    pub transaction_id: String,
    pub price: i64,
    pub transfer_date: NaiveDate,
    pub postcode: Option<String>,
    pub full_address: String,
    pub address_similarity: f64,
    pub date_proximity_score: f64,
    pub postcode_exact_score: f64,
    pub confidence_score: f64,
    pub verification_status: VerificationStatus,
    pub detected_at: DateTime<Utc>,
}

impl MatchCandidate {
    pub fn pair_key(&self) -> (&str, &str) {
        (&self.listing_id, &self.transaction_id)
    }
}

/// A candidate after the persistence layer has assigned it an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMatch {
    pub id: Uuid,
    #[serde(flatten)]
    pub candidate: MatchCandidate,
    pub verified_owner_name: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
}

/// `low` counts pairs that cleared the address floor but scored under the
/// minimum confidence; those pairs are reported here and never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceHistogram {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl ConfidenceHistogram {
    pub fn record(&mut self, confidence: f64, config: &DetectionConfig) {
        if confidence >= config.high_confidence_threshold {
            self.high += 1;
        } else if confidence >= config.min_confidence_threshold {
            self.medium += 1;
        } else {
            self.low += 1;
        }
    }

    pub fn merge(&mut self, other: &ConfidenceHistogram) {
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub total_matches: usize,
    pub confidence_histogram: ConfidenceHistogram,
    pub matches: Vec<MatchCandidate>,
    pub listings_scanned: usize,
    pub listings_skipped: usize,
    pub failed_listings: usize,
    pub newly_persisted: usize,
    pub duplicates_skipped: usize,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(fields: &[&str]) -> RawTransactionRow {
        RawTransactionRow::from_fields(fields.iter().copied()).expect("16 columns")
    }

    fn scenario_row() -> RawTransactionRow {
        raw(&[
            "T1", "450000", "2025-02-20 00:00", "SW1A 1AA", "T", "N", "F", "123", "",
            "High Street", "", "London", "Westminster", "Greater London", "A", "A",
        ])
    }

    #[test]
    fn default_weights_and_config_are_valid() {
        assert_eq!(DetectionConfig::default().validate(), Ok(()));
        assert_eq!(StoreConfig::default().validate(), Ok(()));
    }

    #[test]
    fn weights_that_do_not_sum_to_one_are_rejected() {
        let config = DetectionConfig {
            weights: ScoringWeights {
                address: 0.7,
                date: 0.2,
                postcode: 0.2,
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::WeightSum { .. })));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let config = DetectionConfig {
            min_confidence_threshold: 90.0,
            high_confidence_threshold: 85.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
        let zero_window = DetectionConfig {
            scan_window_months: 0,
            ..Default::default()
        };
        assert!(zero_window.validate().is_err());
    }

    #[test]
    fn date_proximity_decays_linearly_and_floors_at_zero() {
        let config = DetectionConfig::default();
        let withdrawn = NaiveDate::from_ymd_opt(2025, 1, 15);
        assert_eq!(config.date_proximity_score(withdrawn, withdrawn), 100.0);
        let later = NaiveDate::from_ymd_opt(2026, 1, 10);
        assert_eq!(config.date_proximity_score(withdrawn, later), 50.0);
        let far = NaiveDate::from_ymd_opt(2027, 6, 1);
        assert_eq!(config.date_proximity_score(withdrawn, far), 0.0);
        assert_eq!(config.date_proximity_score(None, later), 0.0);
    }

    #[test]
    fn combined_confidence_is_bounded() {
        let weights = ScoringWeights::default();
        assert_eq!(weights.combine(100.0, 100.0, 100.0), 100.0);
        assert_eq!(weights.combine(0.0, 0.0, 0.0), 0.0);
        assert_eq!(weights.combine(85.0, 0.0, 0.0), 59.5);
    }

    #[test]
    fn postcode_helpers() {
        assert_eq!(compact_postcode(" sw1a 1aa "), "SW1A1AA");
        assert_eq!(format_postcode("sw1a1aa"), "SW1A 1AA");
        assert_eq!(format_postcode("E1"), "E1");
        assert_eq!(postcode_prefix("SW1A 1AA").as_deref(), Some("SW1A"));
        assert_eq!(postcode_prefix("m11ae").as_deref(), Some("M11A"));
        assert_eq!(postcode_prefix("  "), None);
        assert!(postcodes_match(Some("sw1a 1aa"), Some("SW1A1AA")));
        assert!(!postcodes_match(Some("SW1A 1AA"), None));
        assert!(!postcodes_match(Some(""), Some(" ")));
    }

    #[test]
    fn raw_row_builds_full_and_normalized_address() {
        let record = TransactionRecord::try_from(scenario_row()).expect("valid row");
        assert_eq!(record.full_address, "123, High Street, London, SW1A 1AA");
        assert_eq!(record.normalized_address, "123 HIGH STREET LONDON SW1A 1AA");
        assert_eq!(record.transfer_date, NaiveDate::from_ymd_opt(2025, 2, 20).unwrap());
        assert_eq!(record.price, 450_000);
    }

    #[test]
    fn rows_missing_required_fields_are_rejected() {
        let mut no_id = scenario_row();
        no_id.transaction_id = None;
        assert_eq!(
            TransactionRecord::try_from(no_id),
            Err(RowRejection::MissingIdentifier)
        );

        let mut no_date = scenario_row();
        no_date.transfer_date = None;
        assert_eq!(
            TransactionRecord::try_from(no_date),
            Err(RowRejection::MissingTransferDate)
        );

        let mut no_address = scenario_row();
        no_address.paon = None;
        no_address.street = None;
        no_address.town = None;
        assert_eq!(
            TransactionRecord::try_from(no_address),
            Err(RowRejection::EmptyAddress)
        );

        let mut bad_price = scenario_row();
        bad_price.price = Some("lots".into());
        assert!(matches!(
            TransactionRecord::try_from(bad_price),
            Err(RowRejection::InvalidPrice(_))
        ));
    }

    #[test]
    fn wrong_column_count_is_a_rejection() {
        let err = RawTransactionRow::from_fields(["a", "b"]).unwrap_err();
        assert_eq!(
            err,
            RowRejection::ColumnCount {
                expected: 16,
                found: 2
            }
        );
    }

    #[test]
    fn feed_dates_accept_known_layouts() {
        let expected = NaiveDate::from_ymd_opt(2025, 2, 20);
        assert_eq!(parse_feed_date("2025-02-20"), expected);
        assert_eq!(parse_feed_date("2025-02-20 00:00"), expected);
        assert_eq!(parse_feed_date("20/02/2025"), expected);
        assert_eq!(parse_feed_date("yesterday"), None);
    }

    #[test]
    fn only_suspicious_matches_can_transition() {
        use VerificationStatus::*;
        assert!(Suspicious.can_transition_to(ConfirmedFraud));
        assert!(Suspicious.can_transition_to(NotFraud));
        assert!(Suspicious.can_transition_to(Error));
        assert!(!Suspicious.can_transition_to(Suspicious));
        assert!(!ConfirmedFraud.can_transition_to(NotFraud));
        assert_eq!("confirmed_fraud".parse::<VerificationStatus>(), Ok(ConfirmedFraud));
    }

    #[test]
    fn histogram_buckets_by_thresholds() {
        let config = DetectionConfig::default();
        let mut histogram = ConfidenceHistogram::default();
        for score in [99.0, 85.0, 84.99, 70.0, 69.99] {
            histogram.record(score, &config);
        }
        assert_eq!(
            histogram,
            ConfidenceHistogram {
                high: 2,
                medium: 2,
                low: 1
            }
        );
    }

    #[test]
    fn listing_status_deserializes_unknown_values() {
        let listing: Listing = serde_json::from_value(serde_json::json!({
            "id": "L1",
            "agency_id": "A1",
            "address": "1 Mill Lane",
            "status": "under_offer"
        }))
        .expect("listing");
        assert_eq!(listing.status, ListingStatus::Other);
        assert!(!listing.is_withdrawn());
        assert_eq!(listing.canonical_address(), "1 MILL LANE");
    }
}
