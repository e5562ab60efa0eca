use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::campaign::reply::ReplyOutcome;
use crate::campaign::store::{EmailHistoryEntry, Store};
use crate::campaign::types::LeadStatus;
use crate::service::config::ReplyMode;

use super::state::AppState;
use super::{blocking, detail, lifecycle_error, store_error, ApiError};

#[derive(Debug, Deserialize)]
pub(super) struct CreateUserRequest {
    pub email: String,
    pub signature_html: Option<String>,
}

pub(super) async fn create_user(
    State(state): State<AppState>,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let store = state.store.clone();
    let user = blocking(move || {
        store.create_user(&request.email, request.signature_html.as_deref())
    })
    .await?
    .map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(json!(user))))
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateCampaignRequest {
    pub user_id: Uuid,
    pub name: String,
    pub pitch: Option<String>,
    pub tone: Option<String>,
}

pub(super) async fn create_campaign(
    State(state): State<AppState>,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let store = state.store.clone();
    let campaign = blocking(move || {
        store.create_campaign(
            request.user_id,
            &request.name,
            request.pitch.as_deref(),
            request.tone.as_deref(),
        )
    })
    .await?
    .map_err(lifecycle_error)?;
    Ok((StatusCode::CREATED, Json(json!(campaign))))
}

pub(super) async fn get_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let stats = blocking(move || store.campaign_stats(campaign_id))
        .await?
        .map_err(store_error)?
        .ok_or_else(|| detail(StatusCode::NOT_FOUND, "campaign not found"))?;
    Ok(Json(json!(stats)))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct LaunchRequest {
    pub start_time: Option<DateTime<Utc>>,
}

pub(super) async fn launch(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    request: Option<Json<LaunchRequest>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let start_time = request.and_then(|Json(request)| request.start_time);
    let lifecycle = state.lifecycle.clone();
    let campaign = blocking(move || lifecycle.launch(campaign_id, start_time))
        .await?
        .map_err(lifecycle_error)?;
    Ok(Json(json!(campaign)))
}

pub(super) async fn pause(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lifecycle = state.lifecycle.clone();
    let campaign = blocking(move || lifecycle.pause(campaign_id))
        .await?
        .map_err(lifecycle_error)?;
    Ok(Json(json!(campaign)))
}

pub(super) async fn resume(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let lifecycle = state.lifecycle.clone();
    let campaign = blocking(move || lifecycle.resume(campaign_id))
        .await?
        .map_err(lifecycle_error)?;
    Ok(Json(json!(campaign)))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let lifecycle = state.lifecycle.clone();
    blocking(move || lifecycle.delete(campaign_id))
        .await?
        .map_err(lifecycle_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct DuplicateRequest {
    pub name: Option<String>,
}

pub(super) async fn duplicate(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    request: Option<Json<DuplicateRequest>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let name = request.and_then(|Json(request)| request.name);
    let lifecycle = state.lifecycle.clone();
    let copy = blocking(move || lifecycle.duplicate(campaign_id, name.as_deref()))
        .await?
        .map_err(lifecycle_error)?;
    Ok((StatusCode::CREATED, Json(json!(copy))))
}

pub(super) async fn next_send(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let job = blocking(move || store.next_pending_job(campaign_id))
        .await?
        .map_err(store_error)?;
    Ok(Json(match job {
        Some(job) => json!({ "next_send_at": job.scheduled_at, "job_id": job.id }),
        None => json!({ "next_send_at": null, "job_id": null }),
    }))
}

pub(super) async fn send_now(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let job = blocking(move || store.send_now(campaign_id, Utc::now()))
        .await?
        .map_err(store_error)?;
    Ok(Json(json!({ "triggered": job.is_some() })))
}

pub(super) async fn step_summary(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let summary = blocking(move || store.step_summary(campaign_id))
        .await?
        .map_err(store_error)?;
    Ok(Json(json!(summary)))
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateLeadRequest {
    pub email: String,
    pub first_name: Option<String>,
    pub company: Option<String>,
}

pub(super) async fn create_lead(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Json(request): Json<CreateLeadRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let store = state.store.clone();
    let lead = blocking(move || {
        store.create_lead(
            campaign_id,
            &request.email,
            request.first_name.as_deref(),
            request.company.as_deref(),
        )
    })
    .await?
    .map_err(lifecycle_error)?;
    Ok((StatusCode::CREATED, Json(json!(lead))))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct LeadFilter {
    pub status: Option<LeadStatus>,
}

pub(super) async fn list_leads(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Query(filter): Query<LeadFilter>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let leads = blocking(move || store.leads_for_campaign(campaign_id, filter.status))
        .await?
        .map_err(store_error)?;
    Ok(Json(json!(leads)))
}

#[derive(Debug, Deserialize)]
pub(super) struct UpsertTemplateRequest {
    pub step_number: i32,
    pub subject: String,
    pub body_html: String,
    #[serde(default)]
    pub delay_minutes: i64,
}

pub(super) async fn upsert_template(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Json(request): Json<UpsertTemplateRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let store = state.store.clone();
    let template = blocking(move || {
        store.upsert_template(
            campaign_id,
            request.step_number,
            &request.subject,
            &request.body_html,
            request.delay_minutes,
        )
    })
    .await?
    .map_err(lifecycle_error)?;
    Ok((StatusCode::CREATED, Json(json!(template))))
}

pub(super) async fn list_templates(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let templates = blocking(move || store.templates_for_campaign(campaign_id))
        .await?
        .map_err(store_error)?;
    Ok(Json(json!(templates)))
}

pub(super) async fn email_history(
    State(state): State<AppState>,
    Path((campaign_id, lead_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let history = blocking(move || -> Result<Vec<EmailHistoryEntry>, ApiError> {
        let lead = store
            .load_lead(lead_id)
            .map_err(store_error)?
            .filter(|lead| lead.campaign_id == campaign_id)
            .ok_or_else(|| detail(StatusCode::NOT_FOUND, "lead not found"))?;
        store.email_history(lead.id).map_err(store_error)
    })
    .await??;
    Ok(Json(json!(history)))
}

/// Development-mode reply injection; drives the same ingestion path as the
/// webhook. Hidden unless REPLY_MODE=simulated.
pub(super) async fn mark_replied(
    State(state): State<AppState>,
    Path((campaign_id, lead_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.config.reply_mode != ReplyMode::Simulated {
        return Err(detail(StatusCode::NOT_FOUND, "not found"));
    }
    let store = state.store.clone();
    let ingestor = state.ingestor.clone();
    let outcome = blocking(move || -> Result<ReplyOutcome, ApiError> {
        store
            .load_lead(lead_id)
            .map_err(store_error)?
            .filter(|lead| lead.campaign_id == campaign_id)
            .ok_or_else(|| detail(StatusCode::NOT_FOUND, "lead not found"))?;
        ingestor.mark_replied(lead_id).map_err(store_error)
    })
    .await??;
    Ok(Json(json!({ "outcome": format!("{:?}", outcome) })))
}

pub(super) async fn retry_failed(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let reset = blocking(move || store.retry_all_failed(campaign_id, Utc::now()))
        .await?
        .map_err(store_error)?;
    Ok(Json(json!({ "reset": reset })))
}

pub(super) async fn failed_jobs(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = state.store.clone();
    let jobs = blocking(move || store.failed_jobs(campaign_id))
        .await?
        .map_err(store_error)?;
    Ok(Json(json!(jobs)))
}

#[derive(Debug, Deserialize)]
pub(super) struct TagRequest {
    pub tag: String,
}

pub(super) async fn add_tag(
    State(state): State<AppState>,
    Path(campaign_id): Path<Uuid>,
    Json(request): Json<TagRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let store = state.store.clone();
    blocking(move || store.add_tag(campaign_id, &request.tag))
        .await?
        .map_err(lifecycle_error)?;
    Ok((StatusCode::CREATED, Json(json!({ "status": "added" }))))
}

pub(super) async fn remove_tag(
    State(state): State<AppState>,
    Path((campaign_id, tag)): Path<(Uuid, String)>,
) -> Result<StatusCode, ApiError> {
    let store = state.store.clone();
    let removed = blocking(move || store.remove_tag(campaign_id, &tag))
        .await?
        .map_err(lifecycle_error)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(detail(StatusCode::NOT_FOUND, "tag not found for this campaign"))
    }
}
