use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::job::{ErrorCode, Job, JobStage, StageError};
use crate::pipeline::PipelineStage;

/// A byte pattern at a fixed offset.
struct Magic {
    offset: usize,
    bytes: &'static [u8],
}

const JPEG: &[Magic] = &[Magic {
    offset: 0,
    bytes: &[0xFF, 0xD8, 0xFF],
}];

const PNG: &[Magic] = &[Magic {
    offset: 0,
    bytes: &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A],
}];

const WEBP: &[Magic] = &[
    Magic {
        offset: 0,
        bytes: b"RIFF",
    },
    Magic {
        offset: 8,
        bytes: b"WEBP",
    },
];

/// Known signature for a declared content type.
fn signature_for(content_type: &str) -> Option<&'static [Magic]> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" | "image/jpg" => Some(JPEG),
        "image/png" => Some(PNG),
        "image/webp" => Some(WEBP),
        _ => None,
    }
}

/// Whether `data` starts with the signature of `content_type`. Unknown types never match.
pub fn matches_signature(content_type: &str, data: &[u8]) -> bool {
    signature_for(content_type).is_some_and(|magics| {
        magics.iter().all(|m| {
            data.get(m.offset..m.offset + m.bytes.len())
                .is_some_and(|window| window == m.bytes)
        })
    })
}

/// Rejects empty, oversize and mis-declared inputs before any decoding.
pub struct ValidateStage;

impl ValidateStage {
    pub fn check(data: &[u8], content_type: &str, max_size: u64) -> Result<(), StageError> {
        if data.is_empty() {
            return Err(StageError::new(ErrorCode::Empty, "input is empty"));
        }
        if data.len() as u64 > max_size {
            return Err(StageError::new(
                ErrorCode::Oversize,
                format!("{} bytes exceeds ceiling of {} bytes", data.len(), max_size),
            ));
        }
        if !matches_signature(content_type, data) {
            return Err(StageError::new(
                ErrorCode::SignatureMismatch,
                format!("content does not match declared type {}", content_type),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStage for ValidateStage {
    fn stage(&self) -> JobStage {
        JobStage::Validating
    }

    async fn process(&self, _ctx: &CancellationToken, job: &mut Job) -> Result<(), StageError> {
        Self::check(&job.raw, &job.claims.content_type, job.claims.max_size)
    }
}
