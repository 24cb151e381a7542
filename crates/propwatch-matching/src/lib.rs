//! Candidate selection and confidence scoring of withdrawn listings against completed sales.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use propwatch_core::address;
use propwatch_core::{
    postcode_prefix, postcodes_match, ConfidenceHistogram, ConfigError, DetectionConfig, Listing,
    MatchCandidate, MatchSummary, TransactionRecord, VerificationStatus,
};
use propwatch_storage::{StoreError, TransactionFilter, TransactionQuery};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

pub mod repository;

pub use repository::{InMemoryMatchRepository, MatchRepository, PersistOutcome, RepositoryError};

pub const CRATE_NAME: &str = "propwatch-matching";

#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("detection worker pool closed")]
    WorkerPoolClosed,
}

/// What happened to one listing/transaction pair.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// Address similarity under the floor; nothing else was computed.
    BelowSimilarityFloor(f64),
    /// Scored, but under the minimum confidence. Reported, never persisted.
    BelowConfidence(f64),
    Match(MatchCandidate),
}

/// Scoring result for one listing against its candidate window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingScore {
    pub matches: Vec<MatchCandidate>,
    pub histogram: ConfidenceHistogram,
    pub candidates_examined: usize,
}

/// Score a single pair. `listing_address` is the listing's canonical address,
/// computed once per listing by the caller.
pub fn score_pair(
    config: &DetectionConfig,
    listing: &Listing,
    listing_address: &str,
    transaction: &TransactionRecord,
    detected_at: DateTime<Utc>,
) -> PairOutcome {
    let similarity = address::similarity(listing_address, &transaction.normalized_address);
    if similarity < config.min_address_similarity {
        return PairOutcome::BelowSimilarityFloor(similarity);
    }

    let date_score = config.date_proximity_score(listing.withdrawal_date, Some(transaction.transfer_date));
    let postcode_score = if postcodes_match(listing.postcode.as_deref(), transaction.postcode.as_deref()) {
        100.0
    } else {
        0.0
    };
    let confidence = config.weights.combine(similarity, date_score, postcode_score);
    if confidence < config.min_confidence_threshold {
        return PairOutcome::BelowConfidence(confidence);
    }

    PairOutcome::Match(MatchCandidate {
        listing_id: listing.id.clone(),
        agency_id: listing.agency_id.clone(),
        transaction_id: transaction.transaction_id.clone(),
        price: transaction.price,
        transfer_date: transaction.transfer_date,
        postcode: transaction.postcode.clone(),
        full_address: transaction.full_address.clone(),
        address_similarity: similarity,
        date_proximity_score: date_score,
        postcode_exact_score: postcode_score,
        confidence_score: confidence,
        verification_status: VerificationStatus::Suspicious,
        detected_at,
    })
}

/// Score every candidate for one listing. Matches come back highest confidence first.
pub fn score_listing(
    config: &DetectionConfig,
    listing: &Listing,
    candidates: &[TransactionRecord],
    detected_at: DateTime<Utc>,
) -> ListingScore {
    let listing_address = listing.canonical_address();
    let mut score = ListingScore {
        candidates_examined: candidates.len(),
        ..Default::default()
    };

    for transaction in candidates {
        match score_pair(config, listing, &listing_address, transaction, detected_at) {
            PairOutcome::BelowSimilarityFloor(_) => {}
            PairOutcome::BelowConfidence(confidence) => score.histogram.record(confidence, config),
            PairOutcome::Match(candidate) => {
                score.histogram.record(candidate.confidence_score, config);
                score.matches.push(candidate);
            }
        }
    }

    score.matches.sort_by(|a, b| {
        b.confidence_score
            .total_cmp(&a.confidence_score)
            .then_with(|| a.transaction_id.cmp(&b.transaction_id))
    });
    score
}

/// Candidate window for a listing: `[withdrawal, withdrawal + scan window]`
/// and the listing's postcode prefix. `None` when neither side is known.
pub fn query_window(config: &DetectionConfig, listing: &Listing) -> Option<TransactionFilter> {
    let mut filter = TransactionFilter::new();
    if let Some(withdrawn) = listing.withdrawal_date {
        let until = withdrawn
            .checked_add_signed(Duration::days(config.scan_window_days()))
            .unwrap_or(NaiveDate::MAX);
        filter = filter.between(withdrawn, until);
    }
    if let Some(prefix) = listing.postcode.as_deref().and_then(postcode_prefix) {
        filter = filter.with_prefix(prefix);
    }
    (!filter.is_unbounded()).then_some(filter)
}

pub struct MatchingEngine {
    config: DetectionConfig,
    store: Arc<dyn TransactionQuery>,
    repository: Arc<dyn MatchRepository>,
}

impl MatchingEngine {
    pub fn new(
        config: DetectionConfig,
        store: Arc<dyn TransactionQuery>,
        repository: Arc<dyn MatchRepository>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            repository,
        })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn MatchRepository> {
        &self.repository
    }

    /// Restrict to one agency's listings before detecting.
    pub async fn detect_for_agency(
        &self,
        agency_id: &str,
        listings: &[Listing],
    ) -> Result<MatchSummary, MatchError> {
        let scoped = listings
            .iter()
            .filter(|l| l.agency_id == agency_id)
            .cloned()
            .collect::<Vec<_>>();
        info!(agency_id, listings = scoped.len(), "starting agency detection");
        self.detect(&scoped).await
    }

    /// Match every withdrawn listing against its candidate window and persist qualifying pairs.
    ///
    /// Listings are queried and scored concurrently on the blocking pool. A
    /// failed store query only costs that listing; it is counted and logged
    /// in the summary. Repository failures abort the call.
    #[instrument(skip_all, fields(listings = listings.len()))]
    pub async fn detect(&self, listings: &[Listing]) -> Result<MatchSummary, MatchError> {
        let detected_at = Utc::now();
        let mut summary = MatchSummary::default();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_listings));
        let mut tasks = JoinSet::new();

        for (index, listing) in listings.iter().enumerate() {
            if !listing.is_withdrawn() {
                summary.listings_skipped += 1;
                continue;
            }
            let Some(filter) = query_window(&self.config, listing) else {
                warn!(listing_id = %listing.id, "listing has neither withdrawal date nor postcode; skipped");
                summary.listings_skipped += 1;
                continue;
            };

            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| MatchError::WorkerPoolClosed)?;
            let store = Arc::clone(&self.store);
            let config = self.config.clone();
            let listing = listing.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = store
                    .query(&filter)
                    .map(|candidates| score_listing(&config, &listing, &candidates, detected_at));
                (index, listing.id, result)
            });
        }

        let mut scored: Vec<(usize, String, Result<ListingScore, StoreError>)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => scored.push(result),
                Err(err) => {
                    error!(error = %err, "detection worker failed");
                    summary.failed_listings += 1;
                    summary.errors.push(format!("detection worker failed: {err}"));
                }
            }
        }
        scored.sort_by_key(|(index, _, _)| *index);

        for (_, listing_id, result) in scored {
            summary.listings_scanned += 1;
            let score = match result {
                Ok(score) => score,
                Err(err) => {
                    error!(listing_id = %listing_id, error = %err, "candidate query failed");
                    summary.failed_listings += 1;
                    summary.errors.push(format!("listing {listing_id}: {err}"));
                    continue;
                }
            };
            debug!(
                listing_id = %listing_id,
                candidates = score.candidates_examined,
                matches = score.matches.len(),
                "scored listing"
            );
            summary.confidence_histogram.merge(&score.histogram);
            if score.matches.is_empty() {
                continue;
            }

            let outcome = self.repository.persist(score.matches.clone()).await?;
            summary.newly_persisted += outcome.inserted.len();
            summary.duplicates_skipped += outcome.duplicates;
            summary.matches.extend(score.matches);
        }

        summary.total_matches = summary.matches.len();
        info!(
            matches = summary.total_matches,
            high = summary.confidence_histogram.high,
            medium = summary.confidence_histogram.medium,
            near_misses = summary.confidence_histogram.low,
            persisted = summary.newly_persisted,
            failed_listings = summary.failed_listings,
            "detection complete"
        );
        Ok(summary)
    }
}
