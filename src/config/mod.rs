use serde::Deserialize;
use std::time::Duration;

use crate::db::PoolConfig;
use crate::pipeline::encode::OutputFormat;
use crate::pipeline::PipelineConfig;
use crate::services::broker::BrokerConfig;
use crate::services::consumer::ConsumerConfig;
use crate::services::reclaimer::ReclaimerConfig;
use crate::services::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// HTTP bind address for the worker intake (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string (result stream, idempotency markers, progress)
    pub redis_url: String,

    /// PostgreSQL connection string. Required by the consumer only.
    pub database_url: Option<String>,

    /// Upper bound on pooled database connections. Sized from the consumer's
    /// own tasks when unset.
    pub db_max_connections: Option<u32>,

    /// How long applied entry ids are remembered for redelivery detection
    #[serde(default = "default_entry_retention_hours")]
    pub entry_retention_hours: u64,

    /// Object storage bucket name. Required by the worker only.
    pub r2_bucket: Option<String>,

    /// Object storage endpoint URL (S3-compatible)
    pub r2_endpoint: Option<String>,

    /// Object storage access key ID
    pub r2_access_key: Option<String>,

    /// Object storage secret access key
    pub r2_secret_key: Option<String>,

    /// Ed25519 public key (base64-encoded SPKI PEM) used to verify trust
    /// claims. Required by the worker only.
    pub token_public_key: Option<String>,

    /// Expected `iss` of every trust claim
    #[serde(default = "default_token_issuer")]
    pub token_issuer: String,

    #[serde(default = "default_result_stream")]
    pub result_stream: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Consumer name within the group. Generated per process when unset.
    pub consumer_name: Option<String>,

    /// Approximate cap applied to the result stream on every append
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: u64,

    #[serde(default = "default_ttl_secs")]
    pub idempotency_ttl_secs: u64,

    #[serde(default = "default_ttl_secs")]
    pub progress_ttl_secs: u64,

    /// Capacity of every bounded queue between stages
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_cpu_workers")]
    pub validate_workers: usize,

    #[serde(default = "default_cpu_workers")]
    pub decode_workers: usize,

    #[serde(default = "default_cpu_workers")]
    pub process_workers: usize,

    #[serde(default = "default_cpu_workers")]
    pub encode_workers: usize,

    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    #[serde(default = "default_cpu_workers")]
    pub sink_workers: usize,

    /// Decompression-bomb ceiling (width * height from the header)
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,

    #[serde(default = "default_max_width")]
    pub max_width: u32,

    #[serde(default)]
    pub output_format: OutputFormat,

    /// JPEG quality (1-100)
    #[serde(default = "default_output_quality")]
    pub output_quality: u8,

    #[serde(default = "default_upload_max_attempts")]
    pub upload_max_attempts: u32,

    #[serde(default = "default_upload_base_delay_ms")]
    pub upload_base_delay_ms: u64,

    #[serde(default = "default_consumer_block_ms")]
    pub consumer_block_ms: u64,

    #[serde(default = "default_consumer_batch")]
    pub consumer_batch: usize,

    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,

    #[serde(default = "default_reclaim_min_idle_secs")]
    pub reclaim_min_idle_secs: u64,

    /// Request body limit for the intake route
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Settings only the worker process needs.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub r2_bucket: String,
    pub r2_endpoint: String,
    pub r2_access_key: String,
    pub r2_secret_key: String,
    pub token_public_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required by this process")]
    Missing(&'static str),
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(name))
}

// One connection each for the read loop, the reclaimer and entry pruning.
const CONSUMER_DB_TASKS: u32 = 3;

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_token_issuer() -> String {
    "upload-gateway".to_string()
}

fn default_result_stream() -> String {
    "uploads:results".to_string()
}

fn default_consumer_group() -> String {
    "workers".to_string()
}

fn default_stream_max_len() -> u64 {
    10_000
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_queue_capacity() -> usize {
    64
}

fn default_cpu_workers() -> usize {
    2
}

fn default_upload_workers() -> usize {
    8
}

fn default_max_pixels() -> u64 {
    50_000_000
}

fn default_max_width() -> u32 {
    1920
}

fn default_output_quality() -> u8 {
    85
}

fn default_upload_max_attempts() -> u32 {
    5
}

fn default_upload_base_delay_ms() -> u64 {
    200
}

fn default_consumer_block_ms() -> u64 {
    5000
}

fn default_consumer_batch() -> usize {
    10
}

fn default_reclaim_interval_secs() -> u64 {
    30
}

fn default_reclaim_min_idle_secs() -> u64 {
    60
}

fn default_entry_retention_hours() -> u64 {
    24 * 7
}

fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn worker(&self) -> Result<WorkerSettings, ConfigError> {
        Ok(WorkerSettings {
            r2_bucket: required(&self.r2_bucket, "R2_BUCKET")?,
            r2_endpoint: required(&self.r2_endpoint, "R2_ENDPOINT")?,
            r2_access_key: required(&self.r2_access_key, "R2_ACCESS_KEY")?,
            r2_secret_key: required(&self.r2_secret_key, "R2_SECRET_KEY")?,
            token_public_key: required(&self.token_public_key, "TOKEN_PUBLIC_KEY")?,
        })
    }

    pub fn database(&self) -> Result<PoolConfig, ConfigError> {
        Ok(PoolConfig {
            url: required(&self.database_url, "DATABASE_URL")?,
            max_connections: self.db_max_connections.unwrap_or(CONSUMER_DB_TASKS).max(1),
            min_connections: 1,
        })
    }

    pub fn entry_retention(&self) -> Duration {
        Duration::from_secs(self.entry_retention_hours * 3600)
    }

    pub fn broker(&self) -> BrokerConfig {
        BrokerConfig {
            redis_url: self.redis_url.clone(),
            result_stream: self.result_stream.clone(),
            consumer_group: self.consumer_group.clone(),
            stream_max_len: self.stream_max_len,
            idempotency_ttl: Duration::from_secs(self.idempotency_ttl_secs),
            progress_ttl: Duration::from_secs(self.progress_ttl_secs),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            queue_capacity: self.queue_capacity,
            validate_workers: self.validate_workers,
            decode_workers: self.decode_workers,
            process_workers: self.process_workers,
            encode_workers: self.encode_workers,
            upload_workers: self.upload_workers,
            sink_workers: self.sink_workers,
            max_pixels: self.max_pixels,
            max_width: self.max_width,
            output_format: self.output_format,
            output_quality: self.output_quality,
            upload_retry: RetryPolicy::bounded(
                self.upload_max_attempts,
                Duration::from_millis(self.upload_base_delay_ms),
            ),
        }
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            name: self
                .consumer_name
                .clone()
                .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::new_v4())),
            batch: self.consumer_batch,
            block: Duration::from_millis(self.consumer_block_ms),
        }
    }

    pub fn reclaimer(&self) -> ReclaimerConfig {
        ReclaimerConfig {
            interval: Duration::from_secs(self.reclaim_interval_secs.max(1)),
            min_idle: Duration::from_secs(self.reclaim_min_idle_secs),
            batch: self.consumer_batch,
        }
    }
}
