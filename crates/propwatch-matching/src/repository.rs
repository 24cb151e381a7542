//! Match persistence contract and an in-memory implementation.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;
use propwatch_core::{MatchCandidate, PersistedMatch, VerificationStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("match {0} not found")]
    NotFound(Uuid),
    #[error("cannot move match {id} from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: VerificationStatus,
        to: VerificationStatus,
    },
    #[error("match persistence failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Default)]
pub struct PersistOutcome {
    pub inserted: Vec<PersistedMatch>,
    pub duplicates: usize,
}

/// Storage for detected matches. At most one row per (listing, transaction) pair.
#[async_trait]
pub trait MatchRepository: Send + Sync {
    /// Insert candidates whose pair is not stored yet; identities are assigned here.
    async fn persist(&self, candidates: Vec<MatchCandidate>) -> Result<PersistOutcome, RepositoryError>;

    async fn find(&self, id: Uuid) -> Result<Option<PersistedMatch>, RepositoryError>;

    /// Inclusive confidence range, highest confidence first.
    async fn by_confidence(&self, min: f64, max: f64) -> Result<Vec<PersistedMatch>, RepositoryError>;

    async fn by_status(&self, status: VerificationStatus) -> Result<Vec<PersistedMatch>, RepositoryError>;

    async fn by_listing(&self, listing_id: &str) -> Result<Vec<PersistedMatch>, RepositoryError>;

    /// Verification-stage transition out of `suspicious`.
    async fn transition_status(
        &self,
        id: Uuid,
        to: VerificationStatus,
        verified_owner_name: Option<String>,
    ) -> Result<PersistedMatch, RepositoryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryMatchRepository {
    rows: Mutex<Vec<PersistedMatch>>,
}

impl InMemoryMatchRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    async fn select(&self, keep: impl Fn(&PersistedMatch) -> bool) -> Vec<PersistedMatch> {
        let mut out = self
            .rows
            .lock()
            .await
            .iter()
            .filter(|m| keep(m))
            .cloned()
            .collect::<Vec<_>>();
        sort_by_confidence(&mut out);
        out
    }
}

pub(crate) fn sort_by_confidence(rows: &mut [PersistedMatch]) {
    rows.sort_by(|a, b| {
        b.candidate
            .confidence_score
            .total_cmp(&a.candidate.confidence_score)
            .then_with(|| a.candidate.listing_id.cmp(&b.candidate.listing_id))
            .then_with(|| a.candidate.transaction_id.cmp(&b.candidate.transaction_id))
    });
}

#[async_trait]
impl MatchRepository for InMemoryMatchRepository {
    async fn persist(&self, candidates: Vec<MatchCandidate>) -> Result<PersistOutcome, RepositoryError> {
        let mut rows = self.rows.lock().await;
        let mut known = rows
            .iter()
            .map(|m| (m.candidate.listing_id.clone(), m.candidate.transaction_id.clone()))
            .collect::<HashSet<_>>();

        let mut outcome = PersistOutcome::default();
        for candidate in candidates {
            let key = (candidate.listing_id.clone(), candidate.transaction_id.clone());
            if !known.insert(key) {
                outcome.duplicates += 1;
                continue;
            }
            let stored = PersistedMatch {
                id: Uuid::new_v4(),
                candidate,
                verified_owner_name: None,
                verified_at: None,
            };
            rows.push(stored.clone());
            outcome.inserted.push(stored);
        }
        Ok(outcome)
    }

    async fn find(&self, id: Uuid) -> Result<Option<PersistedMatch>, RepositoryError> {
        Ok(self.rows.lock().await.iter().find(|m| m.id == id).cloned())
    }

    async fn by_confidence(&self, min: f64, max: f64) -> Result<Vec<PersistedMatch>, RepositoryError> {
        Ok(self
            .select(|m| m.candidate.confidence_score >= min && m.candidate.confidence_score <= max)
            .await)
    }

    async fn by_status(&self, status: VerificationStatus) -> Result<Vec<PersistedMatch>, RepositoryError> {
        Ok(self.select(|m| m.candidate.verification_status == status).await)
    }

    async fn by_listing(&self, listing_id: &str) -> Result<Vec<PersistedMatch>, RepositoryError> {
        Ok(self.select(|m| m.candidate.listing_id == listing_id).await)
    }

    async fn transition_status(
        &self,
        id: Uuid,
        to: VerificationStatus,
        verified_owner_name: Option<String>,
    ) -> Result<PersistedMatch, RepositoryError> {
        let mut rows = self.rows.lock().await;
        let row = rows
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(RepositoryError::NotFound(id))?;
        let from = row.candidate.verification_status;
        if !from.can_transition_to(to) {
            return Err(RepositoryError::InvalidTransition { id, from, to });
        }
        row.candidate.verification_status = to;
        row.verified_at = Some(Utc::now());
        if verified_owner_name.is_some() {
            row.verified_owner_name = verified_owner_name;
        }
        Ok(row.clone())
    }
}
