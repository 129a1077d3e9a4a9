use std::collections::BTreeMap;

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::data::Permission;

/// Field name → human readable problem, as returned in 422 responses.
pub type FieldErrors = BTreeMap<String, String>;

/// Application-wide error taxonomy with HTTP status mapping.
///
/// # Control plane errors
///
/// Rate limiting, authentication and authorization failures terminate the
/// middleware chain before any handler runs:
///
/// - `RateLimitExceeded` - 429, carries a `Retry-After` hint
/// - `InvalidAuthHeader`, `InvalidCredentials`, `InvalidOrExpiredToken`,
///   `AuthenticationRequired` - 401 with `WWW-Authenticate: Bearer`
/// - `InactiveAccount`, `PermissionDenied` - 403
///
/// # Store errors
///
/// `NotFound`, `EditConflict` and `ConstraintViolation` come out of the
/// store layer and are translated at the handler boundary. A
/// `ConstraintViolation` that escapes a handler unmapped is a server fault.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Malformed Authorization header")]
    InvalidAuthHeader,

    #[error("Invalid authentication credentials")]
    InvalidCredentials,

    #[error("Invalid or expired authentication token")]
    InvalidOrExpiredToken,

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("User account is not activated")]
    InactiveAccount,

    #[error("Missing permission {0}")]
    PermissionDenied(Permission),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("Edit conflict: {0}")]
    EditConflict(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Validation failed for fields {0:?}")]
    FailedValidation(FieldErrors),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Operation timed out: {0}")]
    OperationTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Build a single-field validation failure.
    pub fn failed_validation(field: &str, message: &str) -> Self {
        let mut fields = FieldErrors::new();
        fields.insert(field.to_string(), message.to_string());
        AppError::FailedValidation(fields)
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::InvalidAuthHeader
            | AppError::InvalidCredentials
            | AppError::InvalidOrExpiredToken
            | AppError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            AppError::InactiveAccount | AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            AppError::EditConflict(_) => StatusCode::CONFLICT,
            AppError::FailedValidation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::OperationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::ConstraintViolation(_)
            | AppError::Database(_)
            | AppError::Internal(_)
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AppError::InvalidAuthHeader => "invalid_auth_header",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::InvalidOrExpiredToken => "invalid_or_expired_token",
            AppError::AuthenticationRequired => "authentication_required",
            AppError::InactiveAccount => "inactive_account",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::NotFound(_) => "not_found",
            AppError::MethodNotAllowed(_) => "method_not_allowed",
            AppError::EditConflict(_) => "edit_conflict",
            AppError::FailedValidation(_) => "failed_validation",
            AppError::BadRequest(_) => "bad_request",
            AppError::OperationTimeout(_) => "timeout",
            AppError::ConstraintViolation(_)
            | AppError::Database(_)
            | AppError::Internal(_)
            | AppError::Config(_) => "server_fault",
        }
    }

    /// Client-facing message. Server faults never expose internal details.
    fn public_message(&self) -> String {
        match self {
            AppError::RateLimitExceeded { .. } => "Rate limit exceeded. Please retry later.".into(),
            AppError::InvalidAuthHeader => {
                "The Authorization header must use the form 'Bearer <token>'.".into()
            }
            AppError::InvalidCredentials => "Invalid authentication credentials.".into(),
            AppError::InvalidOrExpiredToken => {
                "Invalid or expired authentication token.".into()
            }
            AppError::AuthenticationRequired => {
                "You must be authenticated to access this resource.".into()
            }
            AppError::InactiveAccount => {
                "Your user account must be activated to access this resource.".into()
            }
            AppError::PermissionDenied(_) => {
                "Your user account doesn't have the necessary permissions to access this resource."
                    .into()
            }
            AppError::NotFound(_) => "The requested resource could not be found.".into(),
            AppError::MethodNotAllowed(method) => {
                format!("The {method} method is not supported for this resource.")
            }
            AppError::EditConflict(_) => {
                "Unable to update the record due to an edit conflict, please try again.".into()
            }
            AppError::FailedValidation(_) => "The request failed validation.".into(),
            AppError::BadRequest(msg) => msg.clone(),
            AppError::OperationTimeout(_) => "Operation timed out. Please try again.".into(),
            AppError::ConstraintViolation(_)
            | AppError::Database(_)
            | AppError::Internal(_)
            | AppError::Config(_) => {
                "The server encountered a problem and could not process your request.".into()
            }
        }
    }
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fields: Option<FieldErrors>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Full detail stays server-side
        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = ErrorResponse {
            error: self.code(),
            message: self.public_message(),
            fields: match &self {
                AppError::FailedValidation(fields) => Some(fields.clone()),
                _ => None,
            },
        };

        let mut response = (status, Json(body)).into_response();

        match &self {
            AppError::RateLimitExceeded { retry_after_secs } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            _ if status == StatusCode::UNAUTHORIZED => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }

        response
    }
}

/// Sanitize JSON body rejection text to avoid leaking internal type names.
///
/// Axum rejection messages mention Rust type paths; clients only need the
/// offending field or a generic hint.
pub fn sanitize_json_error(msg: &str) -> String {
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

    if msg.contains("invalid type") || msg.contains("invalid value") {
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

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_control_plane_statuses() {
        assert_eq!(
            AppError::RateLimitExceeded { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(AppError::InvalidAuthHeader.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InvalidCredentials.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InvalidOrExpiredToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::AuthenticationRequired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::InactiveAccount.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::PermissionDenied(Permission::MoviesWrite).status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_unmapped_constraint_violation_is_server_fault() {
        let err = AppError::ConstraintViolation("users_email_key".to_string());
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "server_fault");
        assert!(!err.public_message().contains("users_email_key"));
    }

    #[test]
    fn test_rate_limit_response_has_retry_after() {
        let response = AppError::RateLimitExceeded { retry_after_secs: 3 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "3");
    }

    #[test]
    fn test_unauthorized_response_has_www_authenticate() {
        let response = AppError::AuthenticationRequired.into_response();
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );

        let response = AppError::PermissionDenied(Permission::MoviesRead).into_response();
        assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
    }

    #[test]
    fn test_database_error_message_is_generic() {
        let err = AppError::Database("connection refused on 10.0.0.5".to_string());
        assert!(!err.public_message().contains("10.0.0.5"));
    }

    #[test]
    fn test_sanitize_missing_field() {
        let msg = "Failed to deserialize the JSON body into the target type: missing field `title` at line 1 column 2";
        assert_eq!(sanitize_json_error(msg), "Missing required field: title");
    }

    #[test]
    fn test_sanitize_unknown_field() {
        let msg = "Failed to deserialize the JSON body into the target type: unknown field `rating`, expected one of `title`, `year`";
        assert_eq!(sanitize_json_error(msg), "Unknown field: rating");
    }

    #[test]
    fn test_sanitize_malformed() {
        assert_eq!(
            sanitize_json_error("EOF while parsing an object at line 1 column 10"),
            "Malformed JSON in request body"
        );
        assert_eq!(sanitize_json_error("something else"), "Invalid request format");
    }
}
