//! # Error Handling
//!
//! HTTP-facing error type and its mapping to JSON responses.
//!
//! Domain modules define their own `thiserror` enums (`LedgerError`,
//! `RegistryError`, `EngineError`, `SessionError`); this module is the single
//! place where they become status codes.
//!
//! ## Response body:
//! ```json
//! {
//!   "error": {
//!     "type": "quota_exhausted",
//!     "message": "Quota exhausted",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::orchestrator::SessionError;
use crate::session::{AdmissionRejection, LedgerError};
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned by HTTP handlers.
///
/// ## Status mapping:
/// - **Rejected**: 403 for `BLOCKED`, 409 for `ALREADY_ACTIVE`, 429 for
///   `QUOTA_EXHAUSTED`, 503 for `LEDGER_UNAVAILABLE`
/// - **ServiceUnavailable**: 503 (registry or other storage outage)
/// - **BadGateway**: 502 (external engine failed to provision)
/// - **BadRequest / ValidationError**: 400
/// - **NotFound**: 404
/// - **Internal / ConfigError / InvariantViolation**: 500
#[derive(Debug)]
pub enum AppError {
    /// Unexpected server-side failure
    Internal(String),

    /// Malformed client input
    BadRequest(String),

    NotFound(String),

    ConfigError(String),

    ValidationError(String),

    /// Admission refused by the quota ledger
    Rejected(AdmissionRejection),

    /// A backing store is down
    ServiceUnavailable(String),

    /// The external conversational engine could not provision a session
    BadGateway(String),

    /// Illegal state transition or double link; a bug, never retried
    InvariantViolation(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Rejected(reason) => write!(f, "{}", rejection_message(reason)),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::BadGateway(msg) => write!(f, "External engine unavailable: {}", msg),
            AppError::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error type used in the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Rejected(AdmissionRejection::Blocked) => "blocked",
            AppError::Rejected(AdmissionRejection::AlreadyActive) => "already_active",
            AppError::Rejected(AdmissionRejection::QuotaExhausted { .. }) => "quota_exhausted",
            AppError::Rejected(AdmissionRejection::LedgerUnavailable) => "ledger_unavailable",
            AppError::ServiceUnavailable(_) => "registry_unavailable",
            AppError::BadGateway(_) => "external_engine_unavailable",
            AppError::InvariantViolation(_) => "invariant_violation",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) | AppError::InvariantViolation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Rejected(AdmissionRejection::Blocked) => StatusCode::FORBIDDEN,
            AppError::Rejected(AdmissionRejection::AlreadyActive) => StatusCode::CONFLICT,
            AppError::Rejected(AdmissionRejection::QuotaExhausted { .. }) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Rejected(AdmissionRejection::LedgerUnavailable) | AppError::ServiceUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        });
        // Clients show the reset time on a quota rejection
        if let AppError::Rejected(AdmissionRejection::QuotaExhausted { reset_at }) = self {
            body["error"]["reset_at"] = json!(reset_at.to_rfc3339());
        }

        HttpResponse::build(self.status_code()).json(body)
    }
}

fn rejection_message(reason: &AdmissionRejection) -> &'static str {
    match reason {
        AdmissionRejection::Blocked => "This client is blocked from starting sessions",
        AdmissionRejection::AlreadyActive => "A session is already active for this client",
        AdmissionRejection::QuotaExhausted { .. } => "Quota exhausted",
        AdmissionRejection::LedgerUnavailable => "Quota service unavailable, try again shortly",
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Rejected(reason) => AppError::Rejected(reason),
            SessionError::RegistryUnavailable(msg) => AppError::ServiceUnavailable(msg),
            SessionError::ExternalEngineUnavailable { message, .. } => AppError::BadGateway(message),
            SessionError::NotFound(id) => AppError::NotFound(format!("session {}", id)),
            SessionError::InvalidRequest(msg) => AppError::BadRequest(msg),
            SessionError::InvariantViolation(msg) => AppError::InvariantViolation(msg),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidIdentity => AppError::BadRequest(err.to_string()),
            LedgerError::Storage(_) | LedgerError::Contention(_) => AppError::ServiceUnavailable(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
