//! Postgres-backed ingestion history and match repository.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use propwatch_core::{IngestionRecord, MatchCandidate, PersistedMatch, VerificationStatus};
use propwatch_matching::{MatchRepository, PersistOutcome, RepositoryError};
use propwatch_storage::{ensure_recordable, IngestionTracker, StoreError};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, PgArguments>;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

fn tracker_err(err: sqlx::Error) -> StoreError {
    StoreError::Tracker(err.to_string())
}

fn backend_err(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Backend(err.to_string())
}

#[derive(Debug, Clone)]
pub struct PgIngestionTracker {
    pool: PgPool,
}

impl PgIngestionTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ingestion_from_row(row: &PgRow) -> Result<IngestionRecord, sqlx::Error> {
    let source_path: Option<String> = row.try_get("source_path")?;
    let location: String = row.try_get("location")?;
    let month: Option<i32> = row.try_get("month")?;
    let row_count: i64 = row.try_get("row_count")?;
    Ok(IngestionRecord {
        source_filename: row.try_get("source_filename")?,
        source_path: source_path.map(PathBuf::from),
        location: PathBuf::from(location),
        year: row.try_get("year")?,
        month: month.and_then(|m| u32::try_from(m).ok()),
        row_count: usize::try_from(row_count).unwrap_or_default(),
        content_sha256: row.try_get("content_sha256")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

#[async_trait]
impl IngestionTracker for PgIngestionTracker {
    async fn lookup(&self, filename: &str) -> Result<Option<IngestionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT source_filename, source_path, location, year, month, row_count,
                   content_sha256, ingested_at
              FROM ingestion_history
             WHERE source_filename = $1
            "#,
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await
        .map_err(tracker_err)?;
        row.as_ref().map(ingestion_from_row).transpose().map_err(tracker_err)
    }

    async fn record(&self, record: IngestionRecord) -> Result<bool, StoreError> {
        ensure_recordable(&record)?;
        let row_count = i64::try_from(record.row_count)
            .map_err(|err| StoreError::Tracker(format!("row count out of range: {err}")))?;
        let result = sqlx::query(
            r#"
            INSERT INTO ingestion_history
                (source_filename, source_path, location, year, month, row_count,
                 content_sha256, ingested_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (source_filename) DO NOTHING
            "#,
        )
        .bind(&record.source_filename)
        .bind(record.source_path.as_ref().map(|p| p.display().to_string()))
        .bind(record.location.display().to_string())
        .bind(record.year)
        .bind(record.month.and_then(|m| i32::try_from(m).ok()))
        .bind(row_count)
        .bind(&record.content_sha256)
        .bind(record.ingested_at)
        .execute(&self.pool)
        .await
        .map_err(tracker_err)?;

        let inserted = result.rows_affected() == 1;
        if inserted {
            info!(
                filename = %record.source_filename,
                year = record.year,
                rows = record.row_count,
                "recorded ingestion"
            );
        }
        Ok(inserted)
    }

    async fn history(&self) -> Result<Vec<IngestionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT source_filename, source_path, location, year, month, row_count,
                   content_sha256, ingested_at
              FROM ingestion_history
             ORDER BY ingested_at, source_filename
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(tracker_err)?;
        rows.iter()
            .map(ingestion_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(tracker_err)
    }
}

#[derive(Debug, Clone)]
pub struct PgMatchRepository {
    pool: PgPool,
}

impl PgMatchRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select_where(
        &self,
        clause: &str,
        bind: impl FnOnce(PgQuery<'_>) -> PgQuery<'_>,
    ) -> Result<Vec<PersistedMatch>, RepositoryError> {
        let sql = format!(
            "SELECT {MATCH_COLUMNS} FROM match_candidates WHERE {clause} \
             ORDER BY confidence_score DESC, listing_id, transaction_id"
        );
        let rows = bind(sqlx::query(&sql))
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter().map(match_from_row).collect()
    }
}

const MATCH_COLUMNS: &str = "id, listing_id, agency_id, transaction_id, price, transfer_date, postcode, \
     full_address, address_similarity, date_proximity_score, postcode_exact_score, confidence_score, \
     verification_status, verified_owner_name, verified_at, detected_at";

fn match_from_row(row: &PgRow) -> Result<PersistedMatch, RepositoryError> {
    let status: String = row.try_get("verification_status").map_err(backend_err)?;
    let verification_status = status
        .parse::<VerificationStatus>()
        .map_err(|err| RepositoryError::Backend(err.to_string()))?;
    Ok(PersistedMatch {
        id: row.try_get("id").map_err(backend_err)?,
        candidate: MatchCandidate {
            listing_id: row.try_get("listing_id").map_err(backend_err)?,
            agency_id: row.try_get("agency_id").map_err(backend_err)?,
            transaction_id: row.try_get("transaction_id").map_err(backend_err)?,
            price: row.try_get("price").map_err(backend_err)?,
            transfer_date: row.try_get("transfer_date").map_err(backend_err)?,
            postcode: row.try_get("postcode").map_err(backend_err)?,
            full_address: row.try_get("full_address").map_err(backend_err)?,
            address_similarity: row.try_get("address_similarity").map_err(backend_err)?,
            date_proximity_score: row.try_get("date_proximity_score").map_err(backend_err)?,
            postcode_exact_score: row.try_get("postcode_exact_score").map_err(backend_err)?,
            confidence_score: row.try_get("confidence_score").map_err(backend_err)?,
            verification_status,
            detected_at: row.try_get("detected_at").map_err(backend_err)?,
        },
        verified_owner_name: row.try_get("verified_owner_name").map_err(backend_err)?,
        verified_at: row.try_get("verified_at").map_err(backend_err)?,
    })
}

#[async_trait]
impl MatchRepository for PgMatchRepository {
    async fn persist(&self, candidates: Vec<MatchCandidate>) -> Result<PersistOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let mut outcome = PersistOutcome::default();
        for candidate in candidates {
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO match_candidates
                    (id, listing_id, agency_id, transaction_id, price, transfer_date, postcode,
                     full_address, address_similarity, date_proximity_score, postcode_exact_score,
                     confidence_score, verification_status, detected_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                ON CONFLICT (listing_id, transaction_id) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&candidate.listing_id)
            .bind(&candidate.agency_id)
            .bind(&candidate.transaction_id)
            .bind(candidate.price)
            .bind(candidate.transfer_date)
            .bind(&candidate.postcode)
            .bind(&candidate.full_address)
            .bind(candidate.address_similarity)
            .bind(candidate.date_proximity_score)
            .bind(candidate.postcode_exact_score)
            .bind(candidate.confidence_score)
            .bind(candidate.verification_status.as_str())
            .bind(candidate.detected_at)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend_err)?;

            match inserted {
                Some(id) => outcome.inserted.push(PersistedMatch {
                    id,
                    candidate,
                    verified_owner_name: None,
                    verified_at: None,
                }),
                None => outcome.duplicates += 1,
            }
        }
        tx.commit().await.map_err(backend_err)?;
        Ok(outcome)
    }

    async fn find(&self, id: Uuid) -> Result<Option<PersistedMatch>, RepositoryError> {
        Ok(self
            .select_where("id = $1", |q| q.bind(id))
            .await?
            .into_iter()
            .next())
    }

    async fn by_confidence(&self, min: f64, max: f64) -> Result<Vec<PersistedMatch>, RepositoryError> {
        self.select_where("confidence_score BETWEEN $1 AND $2", |q| q.bind(min).bind(max))
            .await
    }

    async fn by_status(&self, status: VerificationStatus) -> Result<Vec<PersistedMatch>, RepositoryError> {
        self.select_where("verification_status = $1", |q| q.bind(status.as_str()))
            .await
    }

    async fn by_listing(&self, listing_id: &str) -> Result<Vec<PersistedMatch>, RepositoryError> {
        let listing_id = listing_id.to_string();
        self.select_where("listing_id = $1", |q| q.bind(listing_id))
            .await
    }

    async fn transition_status(
        &self,
        id: Uuid,
        to: VerificationStatus,
        verified_owner_name: Option<String>,
    ) -> Result<PersistedMatch, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let current: Option<String> = sqlx::query_scalar(
            "SELECT verification_status FROM match_candidates WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_err)?;
        let from = current
            .ok_or(RepositoryError::NotFound(id))?
            .parse::<VerificationStatus>()
            .map_err(|err| RepositoryError::Backend(err.to_string()))?;
        if !from.can_transition_to(to) {
            return Err(RepositoryError::InvalidTransition { id, from, to });
        }

        let sql = format!(
            "UPDATE match_candidates \
                SET verification_status = $2, \
                    verified_at = NOW(), \
                    verified_owner_name = COALESCE($3, verified_owner_name) \
              WHERE id = $1 \
             RETURNING {MATCH_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(to.as_str())
            .bind(verified_owner_name)
            .fetch_one(&mut *tx)
            .await
            .map_err(backend_err)?;
        let updated = match_from_row(&row)?;
        tx.commit().await.map_err(backend_err)?;
        info!(%id, %from, %to, "match status updated");
        Ok(updated)
    }
}
