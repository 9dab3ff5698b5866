//! HTTP API
//!
//! JSON endpoints over the service:
//! - Issues (submit, vote, classifier results, admin decisions)
//! - Reputation and leaderboards
//! - Token ledger (convert, withdraw, wallets, balances)
//! - Audit log and health
//!
//! Callers are identified by the `x-user-id` / `x-user-role` headers set by
//! the identity provider in front of this service.

pub mod extract;
pub mod issues;
pub mod ledger;
pub mod middleware;
pub mod reputation;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::audit::{AuditEntry, AuditSeverity};
use crate::error::CoreError;
use crate::ledger::LedgerTransaction;
use crate::service::CivicService;

pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use middleware::{Identity, SecurityMiddlewareConfig};

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<CivicService>,
}

/// Error returned by handlers
#[derive(Debug)]
pub enum ApiError {
    /// No identity headers on a request that needs them
    Unauthorized,
    /// Body, query or path failed to parse
    Rejected { status: StatusCode, message: String },
    Core(CoreError),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::Core(err)
    }
}

/// Ledger write response. Replays carry the first request's transaction.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub transaction: LedgerTransaction,
    pub replayed: bool,
}

fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::Forbidden(_) => StatusCode::FORBIDDEN,
        CoreError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        CoreError::DuplicateRequest(_) => StatusCode::OK,
        CoreError::ExternalService { .. } => StatusCode::SERVICE_UNAVAILABLE,
        CoreError::InvariantViolation(_) | CoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Unauthorized => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({
                        "error": "unauthorized",
                        "message": "missing x-user-id header",
                        "retryable": false,
                    })),
                )
                    .into_response();
            }
            ApiError::Rejected { status, message } => {
                debug!(status = status.as_u16(), message = %message, "Malformed request");
                return (
                    status,
                    Json(json!({
                        "error": "invalid_request",
                        "message": message,
                        "retryable": false,
                    })),
                )
                    .into_response();
            }
            ApiError::Core(err) => err,
        };

        if let CoreError::DuplicateRequest(prior) = err {
            return (
                StatusCode::OK,
                Json(TransactionResponse {
                    transaction: *prior,
                    replayed: true,
                }),
            )
                .into_response();
        }

        let status = status_for(&err);
        if status.is_server_error() {
            error!(kind = err.kind(), error = %err, "Request failed");
        } else if status != StatusCode::NOT_FOUND {
            warn!(kind = err.kind(), error = %err, "Request rejected");
        }

        let body = Json(json!({
            "error": err.kind(),
            "message": err.to_string(),
            "retryable": err.is_retryable(),
        }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub database: bool,
    /// Classifier reachability, `null` when none is configured
    pub classifier: Option<bool>,
}

/// GET /health
async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let classifier = state.service.issues().classifier_healthy().await;
    Json(HealthResponse {
        status: if classifier == Some(false) { "degraded" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        database: state.service.has_database(),
        classifier,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub min_severity: Option<AuditSeverity>,
    pub user: Option<String>,
}

/// GET /audit - admins only
async fn get_audit(
    State(state): State<ApiState>,
    identity: Identity,
    ApiQuery(query): ApiQuery<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    if !identity.is_admin() {
        return Err(CoreError::Forbidden("audit log is restricted to admins".to_string()).into());
    }

    let audit = state.service.audit();
    let limit = query.limit.unwrap_or(100).min(1000);
    let mut entries = match (query.user, query.min_severity) {
        (Some(user), _) => audit.get_for_user(&user).await,
        (None, Some(severity)) => audit.get_by_severity(severity).await,
        (None, None) => audit.get_recent(limit).await,
    };
    entries.truncate(limit);
    Ok(Json(entries))
}

/// Build the full router
pub fn create_router(service: Arc<CivicService>, security: SecurityMiddlewareConfig) -> Router {
    let state = ApiState { service };

    Router::new()
        .route("/health", get(health))
        .route("/audit", get(get_audit))
        .nest("/issues", issues::create_router())
        .nest("/ledger", ledger::create_router())
        .merge(reputation::create_router())
        .layer(from_fn_with_state(state.clone(), middleware::identity_middleware))
        .layer(DefaultBodyLimit::max(security.max_request_size))
        .layer(from_fn_with_state(security.clone(), middleware::body_size_middleware))
        .layer(from_fn(middleware::security_headers_middleware))
        .layer(from_fn_with_state(security, middleware::logging_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TokenAmount;
    use chrono::Utc;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&CoreError::validation("x")), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&CoreError::not_found("issue", 1)), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&CoreError::InsufficientBalance {
                requested: "1".to_string(),
                available: "0".to_string(),
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_for(&CoreError::ExternalService {
                service: "signer",
                reason: "timeout".to_string(),
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CoreError::InvariantViolation("x".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_replay_is_ok() {
        let tx = LedgerTransaction::convert("alice", "k1", 10, TokenAmount::from_micros(1_000_000), Utc::now());
        let response = ApiError::from(CoreError::DuplicateRequest(Box::new(tx))).into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
