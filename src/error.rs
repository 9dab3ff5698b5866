//! Error taxonomy shared by every component.
//!
//! Validation and not-found errors surface directly to callers. External
//! service errors are always retryable and never leave local state changed.
//! Invariant violations halt the affected operation and are never repaired
//! silently.

use thiserror::Error;

use crate::ledger::LedgerTransaction;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: String, available: String },

    /// Idempotent replay. Carries the transaction recorded by the first request.
    #[error("Duplicate request for idempotency key {}", .0.idempotency_key)]
    DuplicateRequest(Box<LedgerTransaction>),

    #[error("External service {service} unavailable: {reason}")]
    ExternalService { service: &'static str, reason: String },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    /// Short machine-readable kind, used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::NotFound { .. } => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::InsufficientBalance { .. } => "insufficient_balance",
            CoreError::DuplicateRequest(_) => "duplicate_request",
            CoreError::ExternalService { .. } => "external_service_error",
            CoreError::InvariantViolation(_) => "invariant_violation",
            CoreError::Storage(_) => "storage_error",
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ExternalService { .. } | CoreError::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
