use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::campaign::store::Store;

use super::state::AppState;
use super::{blocking, detail, store_error, ApiError};

/// Reset a FAILED job for another run: PENDING, scheduled now, attempt
/// counter cleared.
pub(super) async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let reset = blocking(move || store.retry_job(job_id, Utc::now()))
        .await?
        .map_err(store_error)?;
    if !reset {
        return Err(detail(
            StatusCode::NOT_FOUND,
            "job not found or not in failed status",
        ));
    }
    Ok(Json(json!({ "success": true, "message": "job reset for retry" })))
}
