use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::services::intake::{Admission, IntakeError};
use crate::services::token::TokenError;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// HTTP status and short status string for an intake rejection.
pub fn rejection_status(err: &IntakeError) -> (StatusCode, &'static str) {
    match err {
        IntakeError::Token(e) => (StatusCode::UNAUTHORIZED, e.code().into()),
        IntakeError::Oversize { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "oversize"),
        IntakeError::Busy => (StatusCode::SERVICE_UNAVAILABLE, "busy"),
        IntakeError::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "shutting-down"),
        IntakeError::Broker(_) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    }
}

/// POST /api/v1/uploads — admit a signed upload. Processing is asynchronous.
pub async fn submit_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<UploadResponse>) {
    let Some(token) = bearer_token(&headers) else {
        let err = IntakeError::Token(TokenError::Invalid("missing bearer token".to_string()));
        let (code, status) = rejection_status(&err);
        return (
            code,
            Json(UploadResponse {
                job_id: None,
                status,
                error: Some(err.to_string()),
            }),
        );
    };

    match state.intake.submit(token, body).await {
        Ok(Admission::Accepted { job_id }) => (
            StatusCode::ACCEPTED,
            Json(UploadResponse {
                job_id: Some(job_id),
                status: "accepted",
                error: None,
            }),
        ),
        Ok(Admission::Conflict { job_id }) => (
            StatusCode::CONFLICT,
            Json(UploadResponse {
                job_id: Some(job_id),
                status: "conflict",
                error: None,
            }),
        ),
        Err(err) => {
            let (code, status) = rejection_status(&err);
            tracing::info!(error = %err, status, "Upload rejected");
            (
                code,
                Json(UploadResponse {
                    job_id: None,
                    status,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));
    }

    #[test]
    fn test_rejection_statuses() {
        assert_eq!(
            rejection_status(&IntakeError::Token(TokenError::Expired)),
            (StatusCode::UNAUTHORIZED, "token-expired")
        );
        assert_eq!(
            rejection_status(&IntakeError::Token(TokenError::Invalid("bad".into()))),
            (StatusCode::UNAUTHORIZED, "token-invalid")
        );
        assert_eq!(
            rejection_status(&IntakeError::Oversize { size: 10, limit: 5 }).0,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            rejection_status(&IntakeError::Busy).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
