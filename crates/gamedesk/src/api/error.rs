//! API error handling with structured responses.

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use crate::instance::InstanceError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::BadGateway(_) => "BAD_GATEWAY",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) | ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::ServiceUnavailable(msg) => {
                warn!(error_code = code, message = %msg, "Service unavailable");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details: None,
        };

        (status, Json(body)).into_response()
    }
}

impl From<InstanceError> for ApiError {
    fn from(err: InstanceError) -> Self {
        let message = err.to_string();
        match err {
            InstanceError::NotFound(_) => ApiError::NotFound(message),
            InstanceError::InvalidConfig(_) => ApiError::BadRequest(message),
            InstanceError::ResourceExhausted(_) => ApiError::ServiceUnavailable(message),
            InstanceError::LaunchFailed(_) => ApiError::BadGateway(message),
            InstanceError::InvalidTransition { .. } => ApiError::Conflict(message),
            InstanceError::Store(_) => ApiError::Internal(message),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocationError;
    use crate::instance::InstanceStatus;

    fn status_of(err: InstanceError) -> StatusCode {
        ApiError::from(err).status_code()
    }

    #[test]
    fn instance_errors_map_to_statuses() {
        assert_eq!(
            status_of(InstanceError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(InstanceError::InvalidConfig("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(InstanceError::ResourceExhausted(AllocationError::Exhausted {
                pool: "port",
                requested: 1
            })),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(InstanceError::LaunchFailed("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(InstanceError::InvalidTransition {
                from: InstanceStatus::Failed,
                to: InstanceStatus::Running
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(InstanceError::Store(anyhow::anyhow!("disk full"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ApiError::not_found("x").error_code(), "NOT_FOUND");
        assert_eq!(ApiError::bad_request("x").error_code(), "BAD_REQUEST");
        assert_eq!(ApiError::internal("x").error_code(), "INTERNAL_ERROR");
    }
}
