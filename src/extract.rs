//! Request extractors with client-safe rejections.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{AppError, AppResult, sanitize_json_error};

/// JSON request body.
///
/// Rejections become `AppError::BadRequest` with a sanitized message. Pair
/// with `#[serde(deny_unknown_fields)]` on the target type to refuse unknown
/// keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(&rejection)),
        }
    }
}

fn json_rejection(rejection: &JsonRejection) -> AppError {
    debug!(rejection = %rejection.body_text(), "Rejected JSON body");

    let message = match rejection {
        JsonRejection::MissingJsonContentType(_) => {
            "Expected request with `Content-Type: application/json`".to_string()
        }
        _ if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            "Request body is too large".to_string()
        }
        JsonRejection::JsonSyntaxError(_) => "Malformed JSON in request body".to_string(),
        _ => sanitize_json_error(&rejection.body_text()),
    };

    AppError::BadRequest(message)
}

/// Parse a `{id}` path segment. Anything but a positive integer is a 404.
pub fn parse_id(raw: &str) -> AppResult<i64> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(AppError::NotFound(format!("invalid id '{raw}'"))),
    }
}
