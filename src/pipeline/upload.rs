use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::job::{ErrorCode, Job, JobStage, StageError};
use crate::pipeline::PipelineStage;
use crate::services::retry::{retry_async, RetryError, RetryPolicy};
use crate::services::storage::ObjectStore;

/// Writes the encoded artifact to object storage under the claimed key.
pub struct UploadStage {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl UploadStage {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }
}

#[async_trait]
impl PipelineStage for UploadStage {
    fn stage(&self) -> JobStage {
        JobStage::Uploading
    }

    async fn process(&self, ctx: &CancellationToken, job: &mut Job) -> Result<(), StageError> {
        if job.claims.is_expired_at(Utc::now()) {
            return Err(StageError::new(
                ErrorCode::TokenExpired,
                "trust claim expired before upload",
            ));
        }

        let (encoded, content_type, hash) =
            match (&job.encoded, job.output_content_type, &job.content_hash) {
                (Some(encoded), Some(content_type), Some(hash)) => {
                    (encoded.clone(), content_type, hash.clone())
                }
                _ => {
                    return Err(StageError::new(
                        ErrorCode::EncodeFailed,
                        "no encoded artifact to upload",
                    ))
                }
            };
        let key = job.claims.storage_key.clone();

        let etag = retry_async(&self.retry, ctx, "upload_object", || {
            self.store.put(&key, encoded.clone(), content_type)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { error, attempts } => StageError::new(
                ErrorCode::StorageFailed,
                format!("upload failed after {} attempts: {}", attempts, error),
            ),
            RetryError::Cancelled => {
                StageError::new(ErrorCode::StorageFailed, "upload cancelled on shutdown")
            }
        })?;

        info!(
            job_id = %job.id,
            storage_key = %key,
            bytes = encoded.len(),
            "Artifact stored"
        );
        job.storage_token = Some(etag.unwrap_or(hash));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::claims::TrustClaims;
    use crate::services::storage::{MemoryObjectStore, StorageError};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyStore {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(
            &self,
            _key: &str,
            _data: Bytes,
            _content_type: &str,
        ) -> Result<Option<String>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Status(503));
            }
            Ok(None)
        }
    }

    fn encoded_job(expires_at: i64) -> Job {
        let claims = TrustClaims {
            subject: "user-1".to_string(),
            issuer: "upload-gateway".to_string(),
            job_id: "job-1".to_string(),
            storage_key: "uploads/job-1.jpg".to_string(),
            content_type: "image/png".to_string(),
            max_size: 4096,
            issued_at: 0,
            expires_at,
        };
        let mut job = Job::new(claims, Bytes::new());
        job.encoded = Some(Bytes::from_static(b"artifact"));
        job.output_content_type = Some("image/jpeg");
        job.content_hash = Some("deadbeef".to_string());
        job
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::bounded(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_upload_stores_and_records_token() {
        let store = Arc::new(MemoryObjectStore::default());
        let stage = UploadStage::new(store.clone(), fast_retry(3));
        let mut job = encoded_job(i64::MAX);

        stage.process(&CancellationToken::new(), &mut job).await.unwrap();

        let (data, content_type) = store.get("uploads/job-1.jpg").await.unwrap();
        assert_eq!(&data[..], b"artifact");
        assert_eq!(content_type, "image/jpeg");
        assert!(job.storage_token.is_some());
    }

    #[tokio::test]
    async fn test_retries_then_falls_back_to_hash_token() {
        let store = Arc::new(FlakyStore {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        });
        let stage = UploadStage::new(store.clone(), fast_retry(3));
        let mut job = encoded_job(i64::MAX);

        stage.process(&CancellationToken::new(), &mut job).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.storage_token.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_storage_code() {
        let store = Arc::new(FlakyStore {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });
        let stage = UploadStage::new(store.clone(), fast_retry(2));
        let mut job = encoded_job(i64::MAX);

        let err = stage.process(&CancellationToken::new(), &mut job).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::StorageFailed);
        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_claim_never_writes() {
        let store = Arc::new(MemoryObjectStore::default());
        let stage = UploadStage::new(store.clone(), fast_retry(3));
        let mut job = encoded_job(Utc::now().timestamp() - 1);

        let err = stage.process(&CancellationToken::new(), &mut job).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenExpired);
        assert_eq!(store.write_count().await, 0);
    }
}
