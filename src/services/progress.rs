use std::sync::Arc;

use tracing::warn;

use crate::models::job::{JobStage, StageError};
use crate::models::progress::ProgressRecord;
use crate::services::broker::ProgressStore;

/// Best-effort writer of per-job progress snapshots.
///
/// Store failures are logged and swallowed; progress never affects the
/// outcome of a job.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn ProgressStore>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn ProgressStore>) -> Self {
        Self { store }
    }

    pub async fn report(&self, job_id: &str, stage: JobStage) {
        self.write(job_id, ProgressRecord::at(stage)).await;
    }

    pub async fn report_failure(&self, job_id: &str, err: &StageError) {
        self.write(job_id, ProgressRecord::failed(err.to_string()))
            .await;
    }

    /// Removes the progress record of a job that was admitted but not queued.
    pub async fn clear(&self, job_id: &str) {
        if let Err(e) = self.store.remove(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to remove progress record");
        }
    }

    async fn write(&self, job_id: &str, record: ProgressRecord) {
        if let Err(e) = self.store.put(job_id, &record).await {
            warn!(
                job_id = %job_id,
                stage = %record.stage,
                error = %e,
                "Failed to write progress record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::ErrorCode;
    use crate::services::broker::BrokerError;
    use async_trait::async_trait;

    struct BrokenStore;

    #[async_trait]
    impl ProgressStore for BrokenStore {
        async fn put(&self, _: &str, _: &ProgressRecord) -> Result<(), BrokerError> {
            Err(BrokerError::MalformedReply("store offline".to_string()))
        }

        async fn get(&self, _: &str) -> Result<Option<ProgressRecord>, BrokerError> {
            Ok(None)
        }

        async fn remove(&self, _: &str) -> Result<(), BrokerError> {
            Err(BrokerError::MalformedReply("store offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let reporter = ProgressReporter::new(Arc::new(BrokenStore));
        reporter.report("job-1", JobStage::Decoding).await;
        reporter
            .report_failure("job-1", &StageError::new(ErrorCode::Empty, "no bytes"))
            .await;
        reporter.clear("job-1").await;
    }

    #[tokio::test]
    async fn test_clear_removes_record() {
        let broker = Arc::new(crate::services::memory::MemoryBroker::default());
        let reporter = ProgressReporter::new(broker.clone());
        reporter.report("job-1", JobStage::Admitted).await;
        reporter.clear("job-1").await;

        assert!(broker.get("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_carries_error_detail() {
        let broker = Arc::new(crate::services::memory::MemoryBroker::default());
        let reporter = ProgressReporter::new(broker.clone());
        reporter
            .report_failure(
                "job-1",
                &StageError::new(ErrorCode::Oversize, "2048 bytes exceeds 1024"),
            )
            .await;

        let record = broker.get("job-1").await.unwrap().unwrap();
        assert_eq!(record.stage, JobStage::Failed);
        assert_eq!(record.error.as_deref(), Some("oversize: 2048 bytes exceeds 1024"));
    }
}
