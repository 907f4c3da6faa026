use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::reporter::ReportError;

/// Error body: `{"error": {"type": "...", "code": "...", "message": "..."}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Outcome kind, e.g. "query_error" or "invalid_request_error".
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// Error response for the HTTP endpoints.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_type: &'static str,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        error_type: &'static str,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status,
            error_type,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", code, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorInfo {
                error_type: self.error_type.to_string(),
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ReportError> for ApiError {
    fn from(err: ReportError) -> Self {
        let (status, code) = match &err {
            ReportError::Query(e) if e.is_timeout() => (StatusCode::GATEWAY_TIMEOUT, "ledger_timeout"),
            ReportError::Query(_) => (StatusCode::BAD_GATEWAY, "ledger_error"),
            ReportError::Validation(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_billing_data")
            }
            ReportError::Write(e) if e.is_timeout() => (StatusCode::GATEWAY_TIMEOUT, "sink_timeout"),
            ReportError::Write(_) => (StatusCode::BAD_GATEWAY, "sink_error"),
            ReportError::Deadline(_) => (StatusCode::GATEWAY_TIMEOUT, "request_timeout"),
        };
        Self::new(status, err.kind(), code, err.to_string())
    }
}
