use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{ErrorCode, Job, StageError};

/// Terminal outcome of a job, appended once to the result stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultRecord {
    Success(SuccessRecord),
    Failed(FailureRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessRecord {
    pub job_id: String,
    pub content_hash: String,
    pub storage_token: String,
    pub file_size: u64,
    pub content_type: String,
    pub original_width: u32,
    pub original_height: u32,
    pub processed_width: u32,
    pub processed_height: u32,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub job_id: String,
    pub error_code: ErrorCode,
    pub error_message: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for field: {0}")]
    InvalidField(&'static str),

    #[error("unknown status: {0}")]
    UnknownStatus(String),
}

impl ResultRecord {
    pub fn job_id(&self) -> &str {
        match self {
            ResultRecord::Success(s) => &s.job_id,
            ResultRecord::Failed(f) => &f.job_id,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            ResultRecord::Success(_) => "success",
            ResultRecord::Failed(_) => "failed",
        }
    }

    pub fn failure(job_id: impl Into<String>, err: &StageError) -> Self {
        ResultRecord::Failed(FailureRecord {
            job_id: job_id.into(),
            error_code: err.code,
            error_message: err.message.clone(),
            failed_at: Utc::now(),
        })
    }

    /// Builds the terminal record for a job leaving the pipeline.
    ///
    /// A job without an error slot that is missing any artifact field is
    /// reported as an encode failure rather than a partial success.
    pub fn from_job(job: &Job) -> Self {
        if let Some(err) = &job.error {
            return Self::failure(&job.id, err);
        }

        let artifact = (
            job.content_hash.as_ref(),
            job.storage_token.as_ref(),
            job.encoded.as_ref(),
            job.output_content_type,
            job.original,
            job.processed,
        );
        match artifact {
            (
                Some(hash),
                Some(token),
                Some(encoded),
                Some(content_type),
                Some(original),
                Some(processed),
            ) => ResultRecord::Success(SuccessRecord {
                job_id: job.id.clone(),
                content_hash: hash.clone(),
                storage_token: token.clone(),
                file_size: encoded.len() as u64,
                content_type: content_type.to_string(),
                original_width: original.width,
                original_height: original.height,
                processed_width: processed.width,
                processed_height: processed.height,
                processed_at: Utc::now(),
            }),
            _ => Self::failure(
                &job.id,
                &StageError::new(
                    ErrorCode::EncodeFailed,
                    "pipeline finished without a complete artifact",
                ),
            ),
        }
    }

    /// Flat field list as written to the stream entry.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        match self {
            ResultRecord::Success(s) => vec![
                ("job_id", s.job_id.clone()),
                ("status", "success".to_string()),
                ("content_hash", s.content_hash.clone()),
                ("storage_token", s.storage_token.clone()),
                ("file_size", s.file_size.to_string()),
                ("content_type", s.content_type.clone()),
                ("original_width", s.original_width.to_string()),
                ("original_height", s.original_height.to_string()),
                ("processed_width", s.processed_width.to_string()),
                ("processed_height", s.processed_height.to_string()),
                ("processed_at", s.processed_at.to_rfc3339()),
            ],
            ResultRecord::Failed(f) => vec![
                ("job_id", f.job_id.clone()),
                ("status", "failed".to_string()),
                ("error_code", f.error_code.to_string()),
                ("error_message", f.error_message.clone()),
                ("failed_at", f.failed_at.to_rfc3339()),
            ],
        }
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        let get = |name: &'static str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(RecordError::MissingField(name))
        };
        fn parse<T: FromStr>(name: &'static str, raw: &str) -> Result<T, RecordError> {
            raw.parse().map_err(|_| RecordError::InvalidField(name))
        }
        fn timestamp(name: &'static str, raw: &str) -> Result<DateTime<Utc>, RecordError> {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|_| RecordError::InvalidField(name))
        }

        let job_id = get("job_id")?.to_string();
        match get("status")? {
            "success" => Ok(ResultRecord::Success(SuccessRecord {
                job_id,
                content_hash: get("content_hash")?.to_string(),
                storage_token: get("storage_token")?.to_string(),
                file_size: parse("file_size", get("file_size")?)?,
                content_type: get("content_type")?.to_string(),
                original_width: parse("original_width", get("original_width")?)?,
                original_height: parse("original_height", get("original_height")?)?,
                processed_width: parse("processed_width", get("processed_width")?)?,
                processed_height: parse("processed_height", get("processed_height")?)?,
                processed_at: timestamp("processed_at", get("processed_at")?)?,
            })),
            "failed" => Ok(ResultRecord::Failed(FailureRecord {
                job_id,
                error_code: parse("error_code", get("error_code")?)?,
                error_message: get("error_message")?.to_string(),
                failed_at: timestamp("failed_at", get("failed_at")?)?,
            })),
            other => Err(RecordError::UnknownStatus(other.to_string())),
        }
    }
}
