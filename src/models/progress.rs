use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::JobStage;
use crate::models::result::RecordError;

/// Short-lived snapshot of where a job currently is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub stage: JobStage,
    pub progress: i32,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressRecord {
    pub fn at(stage: JobStage) -> Self {
        Self {
            stage,
            progress: stage.percent(),
            updated_at: Utc::now(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::at(JobStage::Failed)
        }
    }

    /// Hash fields as stored under `status:{job_id}`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("stage", self.stage.to_string()),
            ("progress", self.progress.to_string()),
            ("updated_at", self.updated_at.to_rfc3339()),
        ];
        if let Some(error) = &self.error {
            fields.push(("error", error.clone()));
        }
        fields
    }

    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, RecordError> {
        let get = |name: &'static str| {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or(RecordError::MissingField(name))
        };

        let stage = JobStage::from_str(get("stage")?)
            .map_err(|_| RecordError::InvalidField("stage"))?;
        let progress = get("progress")?
            .parse()
            .map_err(|_| RecordError::InvalidField("progress"))?;
        let updated_at = DateTime::parse_from_rfc3339(get("updated_at")?)
            .map_err(|_| RecordError::InvalidField("updated_at"))?
            .with_timezone(&Utc);

        Ok(Self {
            stage,
            progress,
            updated_at,
            error: fields.get("error").cloned(),
        })
    }
}
