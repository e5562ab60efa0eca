use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::campaign::reply::{BounceOutcome, ReplyOutcome};

use super::auth::verify_webhook;
use super::state::AppState;
use super::{blocking, detail, store_error, ApiError};

pub(super) async fn inbound(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Err(reason) = verify_webhook(&headers, &state.config) {
        return Err(detail(StatusCode::UNAUTHORIZED, reason));
    }

    let inbound = match state.transport.parse_inbound(&body) {
        Ok(inbound) => inbound,
        Err(err) => {
            warn!("failed to parse inbound webhook: {}", err);
            return Err(detail(StatusCode::BAD_REQUEST, "invalid payload"));
        }
    };

    let ingestor = state.ingestor.clone();
    let outcome = blocking(move || ingestor.record_reply(&inbound))
        .await?
        .map_err(store_error)?;
    Ok(Json(match outcome {
        ReplyOutcome::Recorded {
            lead_id,
            canceled_jobs,
        } => json!({
            "status": "success",
            "message": format!("lead {lead_id} marked as replied ({canceled_jobs} jobs canceled)"),
        }),
        ReplyOutcome::AlreadyTerminal { lead_id } => json!({
            "status": "ignored",
            "message": format!("lead {lead_id} already terminal"),
        }),
        ReplyOutcome::NoMatch => json!({
            "status": "ignored",
            "message": "no matching lead",
        }),
    }))
}

pub(super) async fn bounce(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Err(reason) = verify_webhook(&headers, &state.config) {
        return Err(detail(StatusCode::UNAUTHORIZED, reason));
    }

    let bounce = match state.transport.parse_bounce(&body) {
        Ok(bounce) => bounce,
        Err(err) => {
            warn!("failed to parse bounce webhook: {}", err);
            return Err(detail(StatusCode::BAD_REQUEST, "invalid payload"));
        }
    };

    let ingestor = state.ingestor.clone();
    let outcome = blocking(move || ingestor.record_bounce(&bounce))
        .await?
        .map_err(store_error)?;
    Ok(Json(match outcome {
        BounceOutcome::Recorded {
            job_id,
            lead_failed,
        } => json!({
            "status": "received",
            "message": format!("bounce recorded for job {job_id} (lead failed: {lead_failed})"),
        }),
        BounceOutcome::NoMatch => json!({
            "status": "ignored",
            "message": "no matching job",
        }),
    }))
}
