//! Issue endpoints
//!
//!   POST /issues                  -> Submit an issue
//!   GET  /issues                  -> List issues (status, category, severity, reporter)
//!   GET  /issues/stats            -> Counts by status and severity
//!   GET  /issues/{id}             -> Fetch one issue
//!   POST /issues/{id}/votes       -> Set, change or retract a vote
//!   POST /issues/{id}/ai-result   -> Attach a classifier result (admin/service)
//!   POST /issues/{id}/classify    -> Upload an image for classification
//!   POST /issues/{id}/decision    -> Admin override

use axum::{
    Json, Router,
    extract::{Multipart, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;

use super::{ApiError, ApiJson, ApiPath, ApiQuery, ApiState, Identity};
use crate::error::CoreError;
use crate::external::ImageUpload;
use crate::issues::{
    AdminDecision, AiResult, Issue, IssueFilter, IssueId, IssueStats, IssueStatus, IssueSubmission,
    VoteDirection,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub direction: VoteDirection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub decision: AdminDecision,
    /// Status the admin saw when deciding; a mismatch is a conflict
    pub expected_status: Option<IssueStatus>,
}

async fn submit_issue(
    State(state): State<ApiState>,
    identity: Identity,
    ApiJson(submission): ApiJson<IssueSubmission>,
) -> Result<(StatusCode, Json<Issue>), ApiError> {
    let issue = state
        .service
        .issues()
        .submit(&identity.user_id, submission)
        .await?;
    Ok((StatusCode::CREATED, Json(issue)))
}

async fn list_issues(
    State(state): State<ApiState>,
    ApiQuery(filter): ApiQuery<IssueFilter>,
) -> Json<Vec<Issue>> {
    Json(state.service.issues().fetch(&filter).await)
}

async fn issue_stats(State(state): State<ApiState>) -> Json<IssueStats> {
    Json(state.service.issues().stats().await)
}

async fn get_issue(
    State(state): State<ApiState>,
    ApiPath(issue_id): ApiPath<IssueId>,
) -> Result<Json<Issue>, ApiError> {
    Ok(Json(state.service.issues().get(issue_id).await?))
}

async fn record_vote(
    State(state): State<ApiState>,
    identity: Identity,
    ApiPath(issue_id): ApiPath<IssueId>,
    ApiJson(request): ApiJson<VoteRequest>,
) -> Result<Json<Issue>, ApiError> {
    let issue = state
        .service
        .issues()
        .record_vote(issue_id, &identity.user_id, request.direction)
        .await?;
    Ok(Json(issue))
}

async fn attach_ai_result(
    State(state): State<ApiState>,
    identity: Identity,
    ApiPath(issue_id): ApiPath<IssueId>,
    ApiJson(result): ApiJson<AiResult>,
) -> Result<Json<Issue>, ApiError> {
    if !identity.is_admin() {
        return Err(CoreError::Forbidden("only the classifier service may attach AI results".to_string()).into());
    }
    Ok(Json(state.service.issues().attach_ai_result(issue_id, result).await?))
}

/// Multipart upload with an `image_file` part
async fn classify_issue(
    State(state): State<ApiState>,
    identity: Identity,
    ApiPath(issue_id): ApiPath<IssueId>,
    mut multipart: Multipart,
) -> Result<Json<Issue>, ApiError> {
    let issue = state.service.issues().get(issue_id).await?;
    if issue.reporter != identity.user_id && !identity.is_admin() {
        return Err(CoreError::Forbidden("only the reporter may upload the issue image".to_string()).into());
    }

    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| CoreError::validation(format!("invalid multipart body: {}", e)))?
    {
        if field.name() != Some("image_file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        if !content_type.starts_with("image/") {
            return Err(CoreError::validation(format!("unsupported content type: {}", content_type)).into());
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| CoreError::validation(format!("failed to read image: {}", e)))?;
        image = Some(ImageUpload {
            file_name,
            content_type,
            bytes: bytes.to_vec(),
        });
    }

    let image = image.ok_or_else(|| CoreError::validation("image_file part is required"))?;
    Ok(Json(state.service.issues().classify(issue_id, image).await?))
}

async fn admin_decision(
    State(state): State<ApiState>,
    identity: Identity,
    ApiPath(issue_id): ApiPath<IssueId>,
    ApiJson(request): ApiJson<DecisionRequest>,
) -> Result<Json<Issue>, ApiError> {
    let issue = state
        .service
        .issues()
        .admin_decide(issue_id, request.decision, &identity.user_id, request.expected_status)
        .await?;
    Ok(Json(issue))
}

pub fn create_router() -> Router<ApiState> {
    Router::new()
        .route("/", post(submit_issue).get(list_issues))
        .route("/stats", get(issue_stats))
        .route("/{id}", get(get_issue))
        .route("/{id}/votes", post(record_vote))
        .route("/{id}/ai-result", post(attach_ai_result))
        .route("/{id}/classify", post(classify_issue))
        .route("/{id}/decision", post(admin_decision))
}
