//! Capability traits over the shared backend that carries idempotency markers,
//! progress snapshots and the result stream.
//!
//! `RedisBroker` implements all of them against one Redis deployment;
//! `MemoryBroker` implements the same semantics in-process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::progress::ProgressRecord;
use crate::models::result::ResultRecord;

/// Key for the idempotency marker of a job.
pub fn idempotency_key(job_id: &str) -> String {
    format!("upload:{}", job_id)
}

/// Key for the progress hash of a job.
pub fn progress_key(job_id: &str) -> String {
    format!("status:{}", job_id)
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub redis_url: String,
    pub result_stream: String,
    pub consumer_group: String,
    /// Approximate stream length kept after each append.
    pub stream_max_len: u64,
    pub idempotency_ttl: Duration,
    pub progress_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            result_stream: "uploads:results".to_string(),
            consumer_group: "workers".to_string(),
            stream_max_len: 10_000,
            idempotency_ttl: Duration::from_secs(3600),
            progress_ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed reply: {0}")]
    MalformedReply(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

/// A result-stream entry handed to a consumer, not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// Atomic claim-once primitive keyed by job identity.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Sets the marker if absent, with expiry.
    async fn claim(&self, job_id: &str) -> Result<ClaimOutcome, BrokerError>;

    /// Removes the marker. Only used when an admitted job could not be queued.
    async fn release(&self, job_id: &str) -> Result<(), BrokerError>;
}

/// Overwritable per-job progress snapshot with expiry.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn put(&self, job_id: &str, record: &ProgressRecord) -> Result<(), BrokerError>;

    async fn get(&self, job_id: &str) -> Result<Option<ProgressRecord>, BrokerError>;

    /// Drops the snapshot of a job that never entered the pipeline.
    async fn remove(&self, job_id: &str) -> Result<(), BrokerError>;
}

/// Producer side of the result stream.
#[async_trait]
pub trait ResultLog: Send + Sync {
    /// Appends the record and returns the log-assigned entry id.
    async fn append(&self, record: &ResultRecord) -> Result<String, BrokerError>;
}

/// Consumer-group side of the result stream.
#[async_trait]
pub trait ResultStream: Send + Sync {
    /// Creates the consumer group at the start of the stream if it is missing.
    async fn ensure_group(&self) -> Result<(), BrokerError>;

    /// Reads up to `count` never-delivered entries, waiting at most `block`.
    async fn read(
        &self,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, entry_id: &str) -> Result<(), BrokerError>;

    /// Reassigns entries idle for at least `min_idle` to `consumer` and returns them.
    async fn claim_idle(
        &self,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Number of delivered but unacknowledged entries in the group.
    async fn pending_count(&self) -> Result<u64, BrokerError>;
}
