use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::models::result::ResultRecord;
use crate::services::broker::ResultLog;
use crate::services::retry::{retry_async, RetryError, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("publish of result for job {0} abandoned on shutdown")]
    Cancelled(String),

    #[error("publish of result for job {job_id} failed after {attempts} attempts")]
    Exhausted { job_id: String, attempts: u32 },
}

/// Appends terminal result records to the durable log.
///
/// With the default policy a publish is retried until it succeeds or the
/// cancellation token fires.
#[derive(Clone)]
pub struct ResultSink {
    log: Arc<dyn ResultLog>,
    retry: RetryPolicy,
}

impl ResultSink {
    pub fn new(log: Arc<dyn ResultLog>) -> Self {
        Self {
            log,
            retry: RetryPolicy::unbounded(Duration::from_millis(100), Duration::from_secs(30)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn publish(
        &self,
        record: &ResultRecord,
        cancel: &CancellationToken,
    ) -> Result<String, SinkError> {
        let result = retry_async(&self.retry, cancel, "publish_result", || async {
            let outcome = self.log.append(record).await;
            if outcome.is_err() {
                metrics::counter!("upload_result_publish_retries_total").increment(1);
            }
            outcome
        })
        .await;

        match result {
            Ok(entry_id) => {
                metrics::counter!("upload_results_published_total", "status" => record.status())
                    .increment(1);
                info!(
                    job_id = %record.job_id(),
                    entry_id = %entry_id,
                    status = record.status(),
                    "Result published"
                );
                Ok(entry_id)
            }
            Err(RetryError::Exhausted { error, attempts }) => {
                // Only reachable with a bounded policy.
                error!(
                    job_id = %record.job_id(),
                    attempts,
                    error = %error,
                    "Result publish exhausted retries"
                );
                Err(SinkError::Exhausted {
                    job_id: record.job_id().to_string(),
                    attempts,
                })
            }
            Err(RetryError::Cancelled) => {
                error!(job_id = %record.job_id(), "Result publish abandoned on shutdown");
                Err(SinkError::Cancelled(record.job_id().to_string()))
            }
        }
    }
}
