mod health;
pub mod movies;
pub mod tokens;
pub mod users;

use axum::http::Method;

pub use health::{healthcheck, readiness_check};
pub use movies::{create_movie, delete_movie, list_movies, show_movie, update_movie};
pub use tokens::{create_activation_token, create_authentication_token, create_password_reset_token};
pub use users::{activate_user, register_user, update_user_password};

use crate::data::tokens::{TOKEN_PLAINTEXT_LEN, is_well_formed};
use crate::error::{AppError, AppResult};
use crate::validation::Validator;

/// Shape check for a token plaintext submitted in a request body.
pub(crate) fn validate_token_plaintext(plaintext: &str) -> AppResult<()> {
    let mut v = Validator::new();
    v.check(!plaintext.is_empty(), "token", "must be provided");
    v.check(
        plaintext.len() == TOKEN_PLAINTEXT_LEN,
        "token",
        "must be 26 bytes long",
    );
    v.finish()?;

    // Right length but outside the base32 alphabet can never match a stored hash
    if !is_well_formed(plaintext) {
        return Err(AppError::failed_validation("token", "invalid token format"));
    }
    Ok(())
}

/// Router fallback for unknown paths.
pub async fn not_found() -> AppError {
    AppError::NotFound("the requested resource could not be found".to_string())
}

/// Router fallback for a known path with an unsupported method.
pub async fn method_not_allowed(method: Method) -> AppError {
    AppError::MethodNotAllowed(method.to_string())
}
