//! Error taxonomy and the translator that renders it.
//!
//! Every failure a handler or middleware can produce is an [`ApiError`].
//! Rendering lives in exactly one place, [`ErrorTranslator`], so no handler
//! picks its own status code or body shape.
//!
//! # Envelope
//!
//! ```json
//! {
//!   "success": false,
//!   "error": "validation_error",
//!   "message": "Unsupported collection: secrets",
//!   "details": { "collection": "secrets" },
//!   "statusCode": 400,
//!   "timestamp": "2024-01-15T10:30:00Z"
//! }
//! ```
//!
//! # Redaction
//!
//! `Internal` messages are replaced with a generic text unless the translator
//! runs in development mode. The raw message always reaches the log.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::StoreError;

/// Message substituted for internal errors outside development mode.
pub const REDACTED_INTERNAL_MESSAGE: &str = "Something went wrong on our end";

/// Application-wide error kinds, each with a fixed HTTP status.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after_secs: u64,
    },

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    /// Validation failure carrying a map of per-field problems.
    pub fn validation_with(message: impl Into<String>, details: Value) -> Self {
        Self::Validation {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn rate_limited(retry_after_secs: u64) -> Self {
        Self::RateLimited {
            message: "Too many requests, please try again later.".to_string(),
            retry_after_secs,
        }
    }

    /// HTTP status for this kind.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "validation_error",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::Timeout(_) => "timeout",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, ApiError::Internal(_))
    }
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

/// Maps an [`ApiError`] to its envelope and status.
///
/// Total and idempotent: the same error always yields the same status, kind
/// and message, and no input makes it fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorTranslator {
    development: bool,
}

impl ErrorTranslator {
    pub const fn new(development: bool) -> Self {
        Self { development }
    }

    pub const fn production() -> Self {
        Self::new(false)
    }

    pub const fn is_development(&self) -> bool {
        self.development
    }

    pub fn handle(&self, error: &ApiError) -> (ErrorEnvelope, StatusCode) {
        let status = error.status();
        let (message, details, retry_after) = match error {
            ApiError::Validation { message, details } => (message.clone(), details.clone(), None),
            ApiError::RateLimited {
                message,
                retry_after_secs,
            } => (message.clone(), None, Some(*retry_after_secs)),
            ApiError::Internal(raw) if self.development => (
                raw.clone(),
                Some(serde_json::json!({ "cause": raw })),
                None,
            ),
            ApiError::Internal(_) => (REDACTED_INTERNAL_MESSAGE.to_string(), None, None),
            other => (other.to_string(), None, None),
        };

        let envelope = ErrorEnvelope {
            success: false,
            error: error.kind().to_string(),
            message,
            details,
            retry_after,
            status_code: status.as_u16(),
            timestamp: Utc::now(),
        };
        (envelope, status)
    }

    /// Envelope for an error response some other layer produced without an
    /// [`ApiError`] (method not allowed, body too large).
    pub fn handle_status(&self, status: StatusCode) -> ErrorEnvelope {
        let reason = status.canonical_reason().unwrap_or("Request failed");
        ErrorEnvelope {
            success: false,
            error: reason.to_ascii_lowercase().replace([' ', '-'], "_"),
            message: reason.to_string(),
            details: None,
            retry_after: None,
            status_code: status.as_u16(),
            timestamp: Utc::now(),
        }
    }

    /// Render an error as a complete JSON response.
    ///
    /// The error is kept in the response extensions so an outer translator
    /// can re-render it with a different mode.
    pub fn render(&self, error: ApiError) -> Response {
        let (envelope, status) = self.handle(&error);
        let mut response = (status, Json(envelope)).into_response();
        response.extensions_mut().insert(error);
        response
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.is_internal() {
            tracing::error!(error = %self, "Request failed with internal error");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "Request failed");
        }

        ErrorTranslator::production().render(self)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidQuery { message } => ApiError::validation_with(
                "Invalid query",
                serde_json::json!({ "query": message }),
            ),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::MissingJsonContentType(_) => {
                ApiError::validation("Expected request with `Content-Type: application/json`")
            }
            other if other.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                ApiError::validation("Request body is too large")
            }
            other => ApiError::validation(sanitize_serde_error(&other.body_text())),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::validation(sanitize_serde_error(&rejection.body_text()))
    }
}

/// Sanitize serde error messages to avoid leaking internal type information.
///
/// Serde errors can contain internal struct/field names which shouldn't be
/// exposed to external clients. This function extracts the useful parts.
fn sanitize_serde_error(msg: &str) -> String {
    if msg.contains("missing field")
        && let Some(field) = backticked(msg)
    {
        return format!("Missing required field: {field}");
    }

    if msg.contains("unknown field")
        && let Some(field) = backticked(msg)
    {
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

fn backticked(msg: &str) -> Option<&str> {
    let start = msg.find('`')?;
    let rest = msg.get(start + 1..)?;
    let end = rest.find('`')?;
    rest.get(..end)
}

/// Startup configuration failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {name}: {reason}")]
    Invalid { name: String, reason: String },

    #[error("{0}")]
    Inconsistent(String),
}

/// Convenience type alias for Results with ApiError.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_per_kind() {
        assert_eq!(ApiError::validation("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unauthorized("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::forbidden("x").status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::rate_limited(5).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::Timeout("x".into()).status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ApiError::internal("x").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_redacted_in_production() {
        let translator = ErrorTranslator::production();
        let (envelope, status) =
            translator.handle(&ApiError::internal("connection refused at 10.0.0.3"));

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(envelope.message, REDACTED_INTERNAL_MESSAGE);
        assert!(envelope.details.is_none());
        assert_eq!(envelope.error, "internal_error");
    }

    #[test]
    fn test_internal_exposed_in_development() {
        let translator = ErrorTranslator::new(true);
        let (envelope, _) = translator.handle(&ApiError::internal("connection refused"));

        assert_eq!(envelope.message, "connection refused");
        assert_eq!(envelope.details.unwrap()["cause"], "connection refused");
    }

    #[test]
    fn test_validation_details_kept() {
        let error = ApiError::validation_with("bad", serde_json::json!({"limit": "too big"}));
        let (envelope, status) = ErrorTranslator::production().handle(&error);

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope.details.unwrap()["limit"], "too big");
        assert!(!envelope.success);
        assert_eq!(envelope.status_code, 400);
    }

    #[test]
    fn test_rate_limited_carries_retry_after() {
        let (envelope, _) = ErrorTranslator::production().handle(&ApiError::rate_limited(42));
        assert_eq!(envelope.retry_after, Some(42));
    }

    #[test]
    fn test_handle_is_idempotent() {
        let translator = ErrorTranslator::production();
        let error = ApiError::forbidden("nope");
        let (first, s1) = translator.handle(&error);
        let (second, s2) = translator.handle(&error);

        assert_eq!(s1, s2);
        assert_eq!(first.error, second.error);
        assert_eq!(first.message, second.message);
    }

    #[test]
    fn test_handle_status_for_foreign_errors() {
        let envelope = ErrorTranslator::production().handle_status(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(envelope.error, "method_not_allowed");
        assert_eq!(envelope.status_code, 405);
    }

    #[test]
    fn test_render_keeps_error_in_extensions() {
        let response = ErrorTranslator::production().render(ApiError::not_found("missing"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.extensions().get::<ApiError>().is_some());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: ApiError = StoreError::InvalidQuery {
            message: "bad operator".into(),
        }
        .into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: ApiError = StoreError::Internal("disk".into()).into();
        assert!(err.is_internal());
    }

    #[test]
    fn test_sanitize_serde_error() {
        assert_eq!(
            sanitize_serde_error("missing field `query` at line 1 column 2"),
            "Missing required field: query"
        );
        assert_eq!(
            sanitize_serde_error("invalid type: string, expected u64"),
            "Invalid data type in request body"
        );
        assert_eq!(
            sanitize_serde_error("EOF while parsing an object"),
            "Malformed JSON in request body"
        );
        assert_eq!(sanitize_serde_error("???"), "Invalid request format");
    }
}
