//! API Error Handling
//!
//! Structured error responses with proper HTTP status codes and request tracking.

use crate::errors::EngineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level API error response with request tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub request_id: String,
    pub error: ErrorBody,
}

/// Error body with structured information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error code (SESSION_NOT_FOUND, INVALID_BET, BAD_REQUEST, etc.)
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional additional details (can be any JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// API error types with request tracking
#[derive(Debug)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub request_id: String,
    /// Overrides the generic code of `kind`
    pub code: Option<&'static str>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum ApiErrorKind {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Conflict(String),
    UnprocessableEntity(String),
    InternalError(String),
    ServiceUnavailable(String),
}

impl ApiError {
    fn new(kind: ApiErrorKind, request_id: String) -> Self {
        Self {
            kind,
            request_id,
            code: None,
            details: None,
        }
    }

    pub fn not_found(request_id: String, message: String) -> Self {
        Self::new(ApiErrorKind::NotFound(message), request_id)
    }

    pub fn bad_request(request_id: String, message: String) -> Self {
        Self::new(ApiErrorKind::BadRequest(message), request_id)
    }

    pub fn unauthorized(request_id: String, message: String) -> Self {
        Self::new(ApiErrorKind::Unauthorized(message), request_id)
    }

    pub fn internal_error(request_id: String, message: String) -> Self {
        Self::new(ApiErrorKind::InternalError(message), request_id)
    }

    pub fn service_unavailable(request_id: String, message: String) -> Self {
        Self::new(ApiErrorKind::ServiceUnavailable(message), request_id)
    }

    /// Map an engine error onto a status code. Validation errors are 4xx;
    /// storage and commitment faults are 503 so clients know to retry.
    pub fn from_engine(request_id: String, err: EngineError) -> Self {
        let message = err.to_string();
        let kind = match &err {
            EngineError::SessionNotFound(_) | EngineError::UserNotFound(_) => ApiErrorKind::NotFound(message),
            EngineError::InvalidBet(_) | EngineError::InvalidAction(_) => ApiErrorKind::BadRequest(message),
            EngineError::InsufficientBalance { .. } => ApiErrorKind::UnprocessableEntity(message),
            EngineError::InvalidState { .. } | EngineError::UserExists(_) => ApiErrorKind::Conflict(message),
            EngineError::CommitmentFailure(_)
            | EngineError::LedgerConflict(_)
            | EngineError::PersistenceFailure(_) => ApiErrorKind::ServiceUnavailable(message),
            EngineError::Configuration(_) => ApiErrorKind::InternalError(message),
        };

        let details = match &err {
            EngineError::InsufficientBalance { requested, available } => {
                Some(serde_json::json!({ "requested": requested, "available": available }))
            }
            EngineError::InvalidState { status, operation, .. } => {
                Some(serde_json::json!({ "status": status, "operation": operation }))
            }
            e if e.is_retriable() => Some(serde_json::json!({ "retriable": true })),
            _ => None,
        };

        Self {
            kind,
            request_id,
            code: Some(err.code()),
            details,
        }
    }

    pub fn status(&self) -> StatusCode {
        match &self.kind {
            ApiErrorKind::NotFound(_) => StatusCode::NOT_FOUND,
            ApiErrorKind::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiErrorKind::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiErrorKind::Conflict(_) => StatusCode::CONFLICT,
            ApiErrorKind::UnprocessableEntity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiErrorKind::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorKind::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn generic_code(&self) -> &'static str {
        match &self.kind {
            ApiErrorKind::NotFound(_) => "NOT_FOUND",
            ApiErrorKind::BadRequest(_) => "BAD_REQUEST",
            ApiErrorKind::Unauthorized(_) => "UNAUTHORIZED",
            ApiErrorKind::Conflict(_) => "CONFLICT",
            ApiErrorKind::UnprocessableEntity(_) => "UNPROCESSABLE_ENTITY",
            ApiErrorKind::InternalError(_) => "INTERNAL_ERROR",
            ApiErrorKind::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    fn message(&self) -> &str {
        match &self.kind {
            ApiErrorKind::NotFound(msg)
            | ApiErrorKind::BadRequest(msg)
            | ApiErrorKind::Unauthorized(msg)
            | ApiErrorKind::Conflict(msg)
            | ApiErrorKind::UnprocessableEntity(msg)
            | ApiErrorKind::InternalError(msg)
            | ApiErrorKind::ServiceUnavailable(msg) => msg,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.request_id,
            self.code.unwrap_or_else(|| self.generic_code()),
            self.message()
        )
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(request_id = %self.request_id, %status, "{}", self.message());
        }

        let body = Json(ErrorResponse {
            request_id: self.request_id.clone(),
            error: ErrorBody {
                code: self.code.unwrap_or_else(|| self.generic_code()).to_string(),
                message: self.message().to_string(),
                details: self.details.clone(),
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::SessionStatus;
    use uuid::Uuid;

    #[test]
    fn test_engine_error_status_mapping() {
        let rid = || "req-1".to_string();
        let cases = [
            (EngineError::SessionNotFound(Uuid::new_v4()), StatusCode::NOT_FOUND),
            (EngineError::InvalidBet("zero".into()), StatusCode::BAD_REQUEST),
            (
                EngineError::InsufficientBalance { requested: 5, available: 1 },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                EngineError::InvalidState {
                    session_id: Uuid::new_v4(),
                    status: SessionStatus::Resolved,
                    operation: "play",
                },
                StatusCode::CONFLICT,
            ),
            (EngineError::CommitmentFailure("disk".into()), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::LedgerConflict("moved".into()), StatusCode::SERVICE_UNAVAILABLE),
            (EngineError::PersistenceFailure("disk".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from_engine(rid(), err).status(), status);
        }
    }

    #[test]
    fn test_display_uses_engine_code() {
        let err = ApiError::from_engine("req-9".into(), EngineError::InvalidAction("bad cell".into()));
        let text = err.to_string();
        assert!(text.starts_with("[req-9] INVALID_ACTION"));
        assert!(text.contains("bad cell"));
    }
}
