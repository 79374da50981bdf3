//! Orchestrating-side reader of the result stream.
//!
//! Entries are acknowledged only after the applier has committed their
//! effects. An entry whose acknowledgement fails stays pending in the group
//! and comes back through the reclaimer, so appliers must be idempotent per
//! job id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::models::result::{RecordError, ResultRecord};
use crate::services::broker::{BrokerError, Delivery, ResultStream};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Consumer name within the group.
    pub name: String,
    pub batch: usize,
    /// Longest a single read waits for new entries.
    pub block: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Result rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Malformed entry {entry_id}: {source}")]
    Malformed {
        entry_id: String,
        source: RecordError,
    },
}

/// Applies a result record's effects as one transactional unit.
#[async_trait]
pub trait ResultApplier: Send + Sync {
    async fn apply(&self, entry_id: &str, record: &ResultRecord) -> Result<(), ApplyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Applied and acknowledged.
    Applied,
    /// Applied, but the acknowledgement failed; the entry stays pending.
    Unacknowledged,
    /// Not applied; the entry stays pending.
    ApplyFailed,
    /// Unparseable; acknowledged without applying.
    Malformed,
}

pub struct ResultConsumer {
    /// Acknowledgements and group management.
    stream: Arc<dyn ResultStream>,
    /// Blocking reads. Same as `stream` unless set with `with_reader`.
    reader: Arc<dyn ResultStream>,
    applier: Arc<dyn ResultApplier>,
    config: ConsumerConfig,
}

impl ResultConsumer {
    pub fn new(
        stream: Arc<dyn ResultStream>,
        applier: Arc<dyn ResultApplier>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            reader: stream.clone(),
            stream,
            applier,
            config,
        }
    }

    /// Sends blocking reads through `reader`, keeping acknowledgements off the
    /// connection that is parked in a read.
    pub fn with_reader(mut self, reader: Arc<dyn ResultStream>) -> Self {
        self.reader = reader;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Reads and applies until `cancel` fires. The group is created first if
    /// it does not exist. Cancellation interrupts a waiting read, never a
    /// batch that has already been delivered.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        self.stream.ensure_group().await?;
        info!(consumer = %self.config.name, "Result consumer started");

        while !cancel.is_cancelled() {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.read_batch() => read,
            };
            match read {
                Ok(batch) => self.handle_batch(batch).await,
                Err(e) => {
                    error!(consumer = %self.config.name, error = %e, "Result stream read failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!(consumer = %self.config.name, "Result consumer stopped");
        Ok(())
    }

    /// One blocking read followed by handling of every delivered entry.
    /// Returns the number of entries delivered.
    pub async fn poll_once(&self) -> Result<usize, ConsumerError> {
        let batch = self.read_batch().await?;
        let delivered = batch.len();
        self.handle_batch(batch).await;
        Ok(delivered)
    }

    async fn read_batch(&self) -> Result<Vec<Delivery>, ConsumerError> {
        Ok(self
            .reader
            .read(&self.config.name, self.config.batch, self.config.block)
            .await?)
    }

    async fn handle_batch(&self, batch: Vec<Delivery>) {
        for delivery in batch {
            self.handle(delivery).await;
        }
    }

    /// Applies one delivered entry and acknowledges it on success.
    pub async fn handle(&self, delivery: Delivery) -> Handled {
        let record = match ResultRecord::from_fields(&delivery.fields) {
            Ok(record) => record,
            Err(source) => {
                let err = ConsumerError::Malformed {
                    entry_id: delivery.id.clone(),
                    source,
                };
                warn!(error = %err, "Acknowledging malformed result entry");
                if let Err(e) = self.stream.ack(&delivery.id).await {
                    warn!(entry_id = %delivery.id, error = %e, "Failed to acknowledge malformed entry");
                }
                metrics::counter!("upload_results_applied_total", "status" => "malformed")
                    .increment(1);
                return Handled::Malformed;
            }
        };

        if let Err(e) = self.applier.apply(&delivery.id, &record).await {
            error!(
                entry_id = %delivery.id,
                job_id = %record.job_id(),
                error = %e,
                "Failed to apply result, leaving entry pending"
            );
            return Handled::ApplyFailed;
        }
        metrics::counter!("upload_results_applied_total", "status" => record.status())
            .increment(1);

        match self.stream.ack(&delivery.id).await {
            Ok(()) => {
                debug!(
                    entry_id = %delivery.id,
                    job_id = %record.job_id(),
                    status = record.status(),
                    "Result applied"
                );
                Handled::Applied
            }
            Err(e) => {
                warn!(
                    entry_id = %delivery.id,
                    job_id = %record.job_id(),
                    error = %e,
                    "Result applied but not acknowledged, entry stays pending"
                );
                Handled::Unacknowledged
            }
        }
    }
}
