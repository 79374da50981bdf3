use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::progress::ProgressRecord;

/// GET /api/v1/uploads/{job_id}/status — latest progress snapshot.
pub async fn get_upload_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<ProgressRecord>, StatusCode> {
    match state.progress.get(&job_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to read progress");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
