//! Admission of signed uploads into the pipeline.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::models::job::{Job, JobStage};
use crate::pipeline::{Orchestrator, RejectReason, Submission};
use crate::services::broker::{BrokerError, ClaimOutcome, IdempotencyGuard};
use crate::services::progress::ProgressReporter;
use crate::services::token::{TokenError, TokenVerifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted { job_id: String },
    /// The job id already holds a live idempotency marker.
    Conflict { job_id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("body of {size} bytes exceeds the claimed limit of {limit} bytes")]
    Oversize { size: u64, limit: u64 },

    #[error("pipeline is at capacity")]
    Busy,

    #[error("pipeline is shutting down")]
    ShuttingDown,

    #[error("idempotency guard unavailable: {0}")]
    Broker(#[from] BrokerError),
}

impl IntakeError {
    /// Label used on the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            IntakeError::Token(TokenError::Expired) => "token_expired",
            IntakeError::Token(_) => "token_invalid",
            IntakeError::Oversize { .. } => "oversize",
            IntakeError::Busy => "busy",
            IntakeError::ShuttingDown => "shutting_down",
            IntakeError::Broker(_) => "broker",
        }
    }
}

/// Verifies the trust claim, claims the job id once, and hands the job to
/// the orchestrator.
pub struct Intake {
    verifier: TokenVerifier,
    guard: Arc<dyn IdempotencyGuard>,
    reporter: ProgressReporter,
    orchestrator: Arc<Orchestrator>,
}

impl Intake {
    pub fn new(
        verifier: TokenVerifier,
        guard: Arc<dyn IdempotencyGuard>,
        reporter: ProgressReporter,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            verifier,
            guard,
            reporter,
            orchestrator,
        }
    }

    pub async fn submit(&self, token: &str, body: Bytes) -> Result<Admission, IntakeError> {
        let result = self.admit(token, body).await;
        match &result {
            Ok(Admission::Accepted { .. }) => {
                metrics::counter!("upload_jobs_admitted_total").increment(1);
            }
            Ok(Admission::Conflict { .. }) => {
                metrics::counter!("upload_jobs_rejected_total", "reason" => "duplicate")
                    .increment(1);
            }
            Err(e) => {
                metrics::counter!("upload_jobs_rejected_total", "reason" => e.reason())
                    .increment(1);
            }
        }
        result
    }

    async fn admit(&self, token: &str, body: Bytes) -> Result<Admission, IntakeError> {
        let claims = self.verifier.verify(token)?;
        let job_id = claims.job_id.clone();

        let size = body.len() as u64;
        if size > claims.max_size {
            return Err(IntakeError::Oversize {
                size,
                limit: claims.max_size,
            });
        }

        if self.guard.claim(&job_id).await? == ClaimOutcome::AlreadyClaimed {
            info!(job_id = %job_id, "Duplicate submission ignored");
            return Ok(Admission::Conflict { job_id });
        }

        self.reporter.report(&job_id, JobStage::Admitted).await;

        match self.orchestrator.submit(Job::new(claims, body)).await {
            Submission::Accepted => {
                info!(job_id = %job_id, bytes = size, "Job admitted");
                Ok(Admission::Accepted { job_id })
            }
            Submission::Rejected(reason) => {
                warn!(job_id = %job_id, reason = %reason, "Job not queued, releasing marker");
                self.reporter.clear(&job_id).await;
                if let Err(e) = self.guard.release(&job_id).await {
                    warn!(job_id = %job_id, error = %e, "Failed to release idempotency marker");
                }
                Err(match reason {
                    RejectReason::Busy => IntakeError::Busy,
                    RejectReason::ShuttingDown => IntakeError::ShuttingDown,
                })
            }
        }
    }
}
