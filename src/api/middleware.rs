//! Request middleware
//!
//! Provides:
//! - Identity resolution from the identity provider's headers
//! - Request body size limits
//! - Security headers
//! - Request logging with sanitization

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, request::Parts},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::{ApiError, ApiState};
use crate::reputation::Role;

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the user's role (`USER` or `ADMIN`), defaults to `USER`
pub const USER_ROLE_HEADER: &str = "x-user-role";

#[derive(Debug, Clone)]
pub struct SecurityMiddlewareConfig {
    /// Maximum request body size in bytes
    pub max_request_size: usize,
    /// Enable request logging
    pub log_requests: bool,
    /// Mask client addresses in logs
    pub sanitize_logs: bool,
}

impl Default for SecurityMiddlewareConfig {
    fn default() -> Self {
        Self {
            max_request_size: 10 * 1024 * 1024,
            log_requests: true,
            sanitize_logs: true,
        }
    }
}

/// Caller identity as vouched for by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Callers may read their own data; admins may read anyone's
    pub fn ensure_can_read(&self, user_id: &str) -> Result<(), ApiError> {
        if self.user_id == user_id || self.is_admin() {
            return Ok(());
        }
        Err(ApiError::from(crate::error::CoreError::Forbidden(format!(
            "{} may not read data of {}",
            self.user_id, user_id
        ))))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(ApiError::Unauthorized)
    }
}

fn read_identity(headers: &HeaderMap) -> Result<Option<Identity>, ApiError> {
    let Some(user_id) = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    else {
        return Ok(None);
    };

    let role = match headers.get(USER_ROLE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(raw) => raw.parse::<Role>()?,
        None => Role::User,
    };

    Ok(Some(Identity {
        user_id: user_id.to_string(),
        role,
    }))
}

/// Resolve the caller and make sure the reputation engine knows them.
/// Requests without an identity pass through; handlers that need one reject
/// them.
pub async fn identity_middleware(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(identity) = read_identity(request.headers())? {
        let created = state
            .service
            .ensure_user(&identity.user_id, identity.role)
            .await?;
        if created {
            debug!(user_id = %identity.user_id, role = identity.role.as_str(), "Registered user from identity headers");
        }
        request.extensions_mut().insert(identity);
    }
    Ok(next.run(request).await)
}

/// Extract client IP from request, handling proxies
fn get_client_ip(headers: &HeaderMap, addr: Option<&SocketAddr>) -> String {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        return ip.trim().to_string();
    }

    if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return ip.trim().to_string();
    }

    addr.map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Request body size validation middleware
pub async fn body_size_middleware(
    State(config): State<SecurityMiddlewareConfig>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let length = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    if let Some(length) = length
        && length > config.max_request_size
    {
        warn!(
            length = length,
            max = config.max_request_size,
            "Request body too large"
        );
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }

    Ok(next.run(request).await)
}

/// Security headers middleware
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    // Balances and audit data must never be cached
    headers.insert(
        "Cache-Control",
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.remove("Server");

    response
}

/// Request logging middleware with sanitization
pub async fn logging_middleware(
    State(config): State<SecurityMiddlewareConfig>,
    request: Request,
    next: Next,
) -> Response {
    if !config.log_requests {
        return next.run(request).await;
    }

    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client_ip = get_client_ip(request.headers(), addr.as_ref());
    let log_ip = if config.sanitize_logs {
        crate::config::mask_secret(&client_ip)
    } else {
        client_ip
    };

    let response = next.run(request).await;
    let duration = start.elapsed();
    let status = response.status();

    if status.is_server_error() {
        error!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            client_ip = %log_ip,
            "Request failed"
        );
    } else if status.is_client_error() {
        warn!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            client_ip = %log_ip,
            "Client error"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            duration_ms = duration.as_millis() as u64,
            client_ip = %log_ip,
            "Request completed"
        );
    }

    response
}
