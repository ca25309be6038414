//! Postgres-backed [`ListingStore`].
//!
//! One pool with a single connection serves the whole batch. Listing writes
//! share one batch transaction and each runs inside its own savepoint, so a
//! rejected row is rolled back without losing the rows before it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::error::ErrorKind;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Postgres, Transaction};
use tracing::{debug, info, warn};
use trek_core::{ContentFingerprint, ListingRecord, ProcessingRun};

use crate::{
    retry_with_backoff, ApplyIndex, BackoffPolicy, DuplicateGroup, IndexedListing,
    IntegrityReport, ListingStore, StoreError, WriteOutcome,
};

const INSERT_LISTING_SQL: &str = r#"
    INSERT INTO job_listings (
        position_title, posting_date, apply_link,
        work_model, location, company, company_size,
        company_industry, salary, qualifications,
        h1b_sponsored, is_new_grad, job_category,
        content_hash, created_at, updated_at, last_seen_at, is_active
    ) VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
        $13::job_category, $14, $15, $15, $15, TRUE
    )
    RETURNING id::BIGINT
"#;

const UPDATE_LISTING_SQL: &str = r#"
    UPDATE job_listings
       SET position_title = $2,
           posting_date = $3,
           work_model = $4,
           location = $5,
           company = $6,
           company_size = $7,
           company_industry = $8,
           salary = $9,
           qualifications = $10,
           h1b_sponsored = $11,
           is_new_grad = $12,
           job_category = $13::job_category,
           content_hash = $14,
           updated_at = $15,
           last_seen_at = $15
     WHERE id = $1
    RETURNING id::BIGINT
"#;

const CREATE_HISTORY_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS csv_processing_history (
        id SERIAL PRIMARY KEY,
        filename VARCHAR(255) NOT NULL,
        processed_count INTEGER,
        inserted_count INTEGER,
        updated_count INTEGER,
        processed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
"#;

/// Opens a single-connection pool, retrying with linear backoff.
pub async fn connect_with_retry(
    database_url: &str,
    backoff: BackoffPolicy,
) -> Result<PgPool, StoreError> {
    let pool = retry_with_backoff(backoff, "listings database connection", |attempt| {
        debug!(attempt, "connecting to listings database");
        PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
    })
    .await
    .map_err(|(attempts, source)| StoreError::Connect { attempts, source })?;
    info!("connected to listings database");
    Ok(pool)
}

/// Applies the embedded schema migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

pub fn classify_write_error(err: sqlx::Error) -> WriteOutcome {
    match &err {
        sqlx::Error::Database(db) => match db.kind() {
            ErrorKind::UniqueViolation => WriteOutcome::DuplicateKey,
            ErrorKind::NotNullViolation | ErrorKind::CheckViolation | ErrorKind::ForeignKeyViolation => {
                WriteOutcome::ValidationError(db.message().to_string())
            }
            _ => WriteOutcome::InfrastructureError(err.to_string()),
        },
        _ => WriteOutcome::InfrastructureError(err.to_string()),
    }
}

pub struct PgListingStore {
    pool: PgPool,
    batch: Option<Transaction<'static, Postgres>>,
}

impl PgListingStore {
    pub async fn connect(database_url: &str, backoff: BackoffPolicy) -> Result<Self, StoreError> {
        let pool = connect_with_retry(database_url, backoff).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, batch: None }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn batch_tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, sqlx::Error> {
        let tx = match self.batch.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(self.batch.insert(tx))
    }

    async fn write_in_savepoint(
        &mut self,
        sql: &'static str,
        key: Option<i64>,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> Result<i64, sqlx::Error> {
        let now = Utc::now().naive_utc();
        let tx = self.batch_tx().await?;
        let mut savepoint = Connection::begin(&mut **tx).await?;

        let query = match key {
            Some(id) => sqlx::query_scalar::<_, i64>(sql)
                .bind(id)
                .bind(&record.position_title)
                .bind(record.posting_date),
            None => sqlx::query_scalar::<_, i64>(sql)
                .bind(&record.position_title)
                .bind(record.posting_date)
                .bind(&record.apply_link),
        };
        let result = query
            .bind(&record.work_model)
            .bind(&record.location)
            .bind(&record.company)
            .bind(&record.company_size)
            .bind(&record.company_industry)
            .bind(&record.salary)
            .bind(&record.qualifications)
            .bind(record.h1b_sponsored)
            .bind(record.is_new_grad)
            .bind(record.job_category.as_str())
            .bind(fingerprint.as_str())
            .bind(now)
            .fetch_one(&mut *savepoint)
            .await;

        match result {
            Ok(id) => {
                savepoint.commit().await?;
                Ok(id)
            }
            Err(err) => {
                if let Err(rollback_err) = savepoint.rollback().await {
                    warn!(error = %rollback_err, "rolling back listing savepoint failed");
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn load_apply_index(&mut self) -> Result<ApplyIndex, StoreError> {
        let tx = self.batch_tx().await?;
        let rows = sqlx::query_as::<_, (i64, String, Option<String>)>(
            r#"
            SELECT id::BIGINT, apply_link, content_hash
              FROM job_listings
             WHERE apply_link IS NOT NULL
             ORDER BY id
            "#,
        )
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|(_, apply_link, _)| !apply_link.is_empty())
            .map(|(id, apply_link, content_hash)| (apply_link, IndexedListing { id, content_hash }))
            .collect())
    }

    async fn insert_listing(
        &mut self,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> WriteOutcome {
        match self
            .write_in_savepoint(INSERT_LISTING_SQL, None, record, fingerprint)
            .await
        {
            Ok(id) => WriteOutcome::Inserted { id },
            Err(err) => classify_write_error(err),
        }
    }

    async fn update_listing(
        &mut self,
        id: i64,
        record: &ListingRecord,
        fingerprint: &ContentFingerprint,
    ) -> WriteOutcome {
        match self
            .write_in_savepoint(UPDATE_LISTING_SQL, Some(id), record, fingerprint)
            .await
        {
            Ok(id) => WriteOutcome::Updated { id },
            Err(sqlx::Error::RowNotFound) => {
                WriteOutcome::ValidationError(format!("listing {id} no longer exists"))
            }
            Err(err) => classify_write_error(err),
        }
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.batch.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn record_run(&mut self, run: &ProcessingRun) -> Result<(), StoreError> {
        self.commit().await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(CREATE_HISTORY_TABLE_SQL).execute(&mut *tx).await?;
        sqlx::query(
            r#"
            INSERT INTO csv_processing_history
                (filename, processed_count, inserted_count, updated_count, processed_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&run.filename)
        .bind(run.processed_count)
        .bind(run.inserted_count)
        .bind(run.updated_count)
        .bind(run.processed_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn audit(&mut self, stale_cutoff: NaiveDateTime) -> Result<IntegrityReport, StoreError> {
        let tx = self.batch_tx().await?;

        let duplicate_groups: Vec<DuplicateGroup> = sqlx::query_as::<_, (Option<String>, Option<String>, Option<NaiveDateTime>, i64)>(
            r#"
            SELECT position_title, company, posting_date, COUNT(*)
              FROM job_listings
             GROUP BY position_title, company, posting_date
            HAVING COUNT(*) > 1
             ORDER BY COUNT(*) DESC, position_title, company
            "#,
        )
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|(position_title, company, posting_date, count)| DuplicateGroup {
            position_title,
            company,
            posting_date,
            count,
        })
        .collect();

        let missing_required = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id::BIGINT
              FROM job_listings
             WHERE position_title IS NULL
                OR company IS NULL
                OR posting_date IS NULL
             ORDER BY id
            "#,
        )
        .fetch_all(&mut **tx)
        .await?;

        let stale_active = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
              FROM job_listings
             WHERE is_active = TRUE
               AND last_seen_at < $1
            "#,
        )
        .bind(stale_cutoff)
        .fetch_one(&mut **tx)
        .await?;

        Ok(IntegrityReport {
            duplicate_groups,
            missing_required,
            stale_active,
        })
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        let pending = self.batch.take();
        let rollback = match pending {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        };
        self.pool.close().await;
        rollback?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_infrastructure_failures() {
        let outcome = classify_write_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(outcome, WriteOutcome::InfrastructureError(_)));
    }

    #[test]
    fn listing_writes_bind_fifteen_parameters() {
        assert!(INSERT_LISTING_SQL.contains("$15"));
        assert!(!INSERT_LISTING_SQL.contains("$16"));
        assert!(UPDATE_LISTING_SQL.contains("$15"));
        assert!(!UPDATE_LISTING_SQL.contains("$16"));
    }
}
