//! Staged image-processing pipeline.
//!
//! Each stage is an independent transform over a [`Job`]. The orchestrator
//! runs a worker pool per stage, connected by bounded queues, and routes a job
//! straight to the result sink as soon as any stage fails it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::job::{Job, JobStage, StageError};
use crate::services::retry::RetryPolicy;
use crate::services::storage::ObjectStore;

pub mod decode;
pub mod encode;
pub mod orchestrator;
pub mod process;
pub mod upload;
pub mod validate;

pub use orchestrator::{Orchestrator, RejectReason, StageSlot, Submission};

/// A single pipeline step.
///
/// Implementations must honor `ctx` for anything that can wait, and report
/// failures as a classified [`StageError`] rather than panicking.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Progress stage reported when a job enters this step.
    fn stage(&self) -> JobStage;

    async fn process(&self, ctx: &CancellationToken, job: &mut Job) -> Result<(), StageError>;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub validate_workers: usize,
    pub decode_workers: usize,
    pub process_workers: usize,
    pub encode_workers: usize,
    pub upload_workers: usize,
    pub sink_workers: usize,
    pub max_pixels: u64,
    pub max_width: u32,
    pub output_format: encode::OutputFormat,
    pub output_quality: u8,
    pub upload_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            validate_workers: 2,
            decode_workers: 2,
            process_workers: 2,
            encode_workers: 2,
            upload_workers: 8,
            sink_workers: 2,
            max_pixels: 50_000_000,
            max_width: 1920,
            output_format: encode::OutputFormat::Jpeg,
            output_quality: 85,
            upload_retry: RetryPolicy::default(),
        }
    }
}

/// The five standard stages in order, sized from `config`.
pub fn standard_stages(config: &PipelineConfig, store: Arc<dyn ObjectStore>) -> Vec<StageSlot> {
    vec![
        StageSlot::new(validate::ValidateStage, config.validate_workers),
        StageSlot::new(decode::DecodeStage::new(config.max_pixels), config.decode_workers),
        StageSlot::new(process::ProcessStage::default(), config.process_workers),
        StageSlot::new(
            encode::EncodeStage::new(
                config.max_width,
                config.output_format,
                config.output_quality,
            ),
            config.encode_workers,
        ),
        StageSlot::new(
            upload::UploadStage::new(store, config.upload_retry.clone()),
            config.upload_workers,
        ),
    ]
}
