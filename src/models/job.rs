use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};

use crate::models::claims::TrustClaims;

/// Lifecycle stage of an upload job, as reported in the progress record.
///
/// Declaration order is the only legal forward order. `Failed` may follow any
/// non-terminal stage.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStage {
    Admitted,
    Validating,
    Decoding,
    Processing,
    Encoding,
    Uploading,
    Done,
    Failed,
}

impl JobStage {
    /// Percentage reported alongside the stage. `Failed` reports -1.
    pub fn percent(self) -> i32 {
        match self {
            JobStage::Admitted => 0,
            JobStage::Validating => 10,
            JobStage::Decoding => 30,
            JobStage::Processing => 50,
            JobStage::Encoding => 70,
            JobStage::Uploading => 85,
            JobStage::Done => 100,
            JobStage::Failed => -1,
        }
    }

}

/// Failure classification carried by failure result records.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorCode {
    SignatureMismatch,
    Oversize,
    Empty,
    HeaderUnparseable,
    PixelCeilingExceeded,
    DecodeFailed,
    ProcessFailed,
    EncodeFailed,
    StorageFailed,
    TokenExpired,
    TokenInvalid,
}

/// A classified failure raised by a pipeline stage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StageError {
    pub code: ErrorCode,
    pub message: String,
}

impl StageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// An upload job travelling through the pipeline.
///
/// Owned by exactly one stage worker at a time and dropped once the result
/// sink has published its outcome.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub claims: TrustClaims,
    pub raw: Bytes,
    pub pixels: Option<DynamicImage>,
    pub encoded: Option<Bytes>,
    pub output_content_type: Option<&'static str>,
    pub content_hash: Option<String>,
    pub original: Option<Dimensions>,
    pub processed: Option<Dimensions>,
    pub storage_token: Option<String>,
    pub error: Option<StageError>,
    pub admitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(claims: TrustClaims, raw: Bytes) -> Self {
        Self {
            id: claims.job_id.clone(),
            claims,
            raw,
            pixels: None,
            encoded: None,
            output_content_type: None,
            content_hash: None,
            original: None,
            processed: None,
            storage_token: None,
            error: None,
            admitted_at: Utc::now(),
        }
    }

    /// Records `err` and releases the buffers no later stage will read.
    pub fn fail(&mut self, err: StageError) {
        self.pixels = None;
        self.encoded = None;
        self.error = Some(err);
    }
}
