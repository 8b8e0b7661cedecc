//! Mapping of limiter errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::{error, warn};

use crate::error::LimiterError;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Error returned from HTTP handlers.
#[derive(Debug)]
pub struct ApiError(pub LimiterError);

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            LimiterError::Validation(_) => StatusCode::BAD_REQUEST,
            LimiterError::NotFound(_) => StatusCode::NOT_FOUND,
            LimiterError::Conflict(_) => StatusCode::CONFLICT,
            err if err.is_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            LimiterError::Validation(_) => "validation_error",
            LimiterError::NotFound(_) => "not_found",
            LimiterError::Conflict(_) => "conflict",
            err if err.is_unavailable() => "service_unavailable",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match status {
            StatusCode::SERVICE_UNAVAILABLE => {
                warn!(error = %self.0, "Backing store unavailable");
                "Rate limiting is temporarily unavailable".to_string()
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %self.0, "Internal error");
                "Internal server error".to_string()
            }
            _ => self.0.to_string(),
        };

        let body = ErrorResponse {
            error: self.code().to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}
