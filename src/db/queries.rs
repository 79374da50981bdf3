use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::models::result::ResultRecord;
use crate::services::consumer::{ApplyError, ResultApplier};

/// A row of `upload_results`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub job_id: String,
    pub status: String,
    pub content_hash: Option<String>,
    pub storage_token: Option<String>,
    pub file_size: Option<i64>,
    pub processed_width: Option<i32>,
    pub processed_height: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub last_entry_id: String,
}

/// Record a stream entry as applied. Returns false if it was already recorded.
async fn record_entry(
    tx: &mut Transaction<'_, Postgres>,
    entry_id: &str,
    job_id: &str,
) -> Result<bool, sqlx::Error> {
    let inserted = sqlx::query(
        r#"
        INSERT INTO upload_result_entries (entry_id, job_id)
        VALUES ($1, $2)
        ON CONFLICT (entry_id) DO NOTHING
        "#,
    )
    .bind(entry_id)
    .bind(job_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok(inserted == 1)
}

/// Upsert the terminal outcome of a job. A stored success is never replaced
/// by a failure.
async fn upsert_result(
    tx: &mut Transaction<'_, Postgres>,
    entry_id: &str,
    record: &ResultRecord,
) -> Result<u64, sqlx::Error> {
    let query = match record {
        ResultRecord::Success(s) => sqlx::query(
            r#"
            INSERT INTO upload_results (
                job_id, status, content_hash, storage_token, file_size, content_type,
                original_width, original_height, processed_width, processed_height,
                completed_at, last_entry_id
            )
            VALUES ($1, 'success', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (job_id) DO UPDATE SET
                status = 'success',
                content_hash = EXCLUDED.content_hash,
                storage_token = EXCLUDED.storage_token,
                file_size = EXCLUDED.file_size,
                content_type = EXCLUDED.content_type,
                original_width = EXCLUDED.original_width,
                original_height = EXCLUDED.original_height,
                processed_width = EXCLUDED.processed_width,
                processed_height = EXCLUDED.processed_height,
                error_code = NULL,
                error_message = NULL,
                completed_at = EXCLUDED.completed_at,
                last_entry_id = EXCLUDED.last_entry_id,
                updated_at = NOW()
            WHERE upload_results.status <> 'success'
            "#,
        )
        .bind(&s.job_id)
        .bind(&s.content_hash)
        .bind(&s.storage_token)
        .bind(s.file_size as i64)
        .bind(&s.content_type)
        .bind(s.original_width as i32)
        .bind(s.original_height as i32)
        .bind(s.processed_width as i32)
        .bind(s.processed_height as i32)
        .bind(s.processed_at)
        .bind(entry_id),
        ResultRecord::Failed(f) => sqlx::query(
            r#"
            INSERT INTO upload_results (
                job_id, status, error_code, error_message, completed_at, last_entry_id
            )
            VALUES ($1, 'failed', $2, $3, $4, $5)
            ON CONFLICT (job_id) DO UPDATE SET
                error_code = EXCLUDED.error_code,
                error_message = EXCLUDED.error_message,
                completed_at = EXCLUDED.completed_at,
                last_entry_id = EXCLUDED.last_entry_id,
                updated_at = NOW()
            WHERE upload_results.status = 'failed'
            "#,
        )
        .bind(&f.job_id)
        .bind(f.error_code.as_ref())
        .bind(&f.error_message)
        .bind(f.failed_at)
        .bind(entry_id),
    };

    Ok(query.execute(&mut **tx).await?.rows_affected())
}

/// Get the stored outcome of a job
pub async fn get_result(pool: &PgPool, job_id: &str) -> Result<Option<StoredResult>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT job_id, status, content_hash, storage_token, file_size,
               processed_width, processed_height, error_code, error_message,
               completed_at, last_entry_id
        FROM upload_results
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(StoredResult {
            job_id: r.try_get("job_id")?,
            status: r.try_get("status")?,
            content_hash: r.try_get("content_hash")?,
            storage_token: r.try_get("storage_token")?,
            file_size: r.try_get("file_size")?,
            processed_width: r.try_get("processed_width")?,
            processed_height: r.try_get("processed_height")?,
            error_code: r.try_get("error_code")?,
            error_message: r.try_get("error_message")?,
            completed_at: r.try_get("completed_at")?,
            last_entry_id: r.try_get("last_entry_id")?,
        })
    })
    .transpose()
}

/// Forget applied entry ids older than `retention`. Returns the rows removed.
pub async fn prune_applied_entries(pool: &PgPool, retention: Duration) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM upload_result_entries
        WHERE applied_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(retention.as_secs_f64())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Applies result records to PostgreSQL, one transaction per record.
#[derive(Clone)]
pub struct PgResultApplier {
    pool: PgPool,
}

impl PgResultApplier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultApplier for PgResultApplier {
    async fn apply(&self, entry_id: &str, record: &ResultRecord) -> Result<(), ApplyError> {
        let mut tx = self.pool.begin().await?;

        if !record_entry(&mut tx, entry_id, record.job_id()).await? {
            tx.commit().await?;
            debug!(entry_id = %entry_id, job_id = %record.job_id(), "Entry already applied");
            return Ok(());
        }
        let updated = upsert_result(&mut tx, entry_id, record).await?;

        tx.commit().await?;

        debug!(
            entry_id = %entry_id,
            job_id = %record.job_id(),
            rows = updated,
            "Result applied"
        );
        Ok(())
    }
}
