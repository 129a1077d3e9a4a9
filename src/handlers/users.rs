//! Account registration, activation and password reset.
//!
//! Every multi-step change runs inside one store transaction. Emails are
//! queued only after the transaction commits.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::data::users::{validate_password_plaintext, validate_user};
use crate::data::{Password, Permission, Scope, Token, User};
use crate::error::{AppError, AppResult};
use crate::extract::JsonBody;
use crate::mailer::{Template, TemplateData};
use crate::state::AppState;
use crate::store::{self, USERS_EMAIL_UNIQUE};
use crate::validation::Validator;

use super::validate_token_plaintext;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterUserRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivateUserRequest {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdatePasswordRequest {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

/// Map the email uniqueness violation to a field error.
pub(crate) fn duplicate_email(err: AppError) -> AppError {
    match err {
        AppError::ConstraintViolation(constraint) if constraint == USERS_EMAIL_UNIQUE => {
            AppError::failed_validation("email", "a user with this email address already exists")
        }
        other => other,
    }
}

fn invalid_token(scope: Scope) -> impl FnOnce(AppError) -> AppError {
    move |err| match err {
        AppError::NotFound(_) => {
            let message = match scope {
                Scope::Activation => "invalid or expired activation token",
                Scope::PasswordReset => "invalid or expired password reset token",
                Scope::Authentication => "invalid or expired authentication token",
            };
            AppError::failed_validation("token", message)
        }
        other => other,
    }
}

/// `POST /v1/users`
///
/// Creates the account, grants `movies:read` and issues an activation token
/// in one transaction, then emails the token from a background task.
#[instrument(skip(state, input))]
pub async fn register_user(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<RegisterUserRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut user = User::new(input.name, input.email, Password::default());

    let mut v = Validator::new();
    validate_user(&mut v, &user);
    validate_password_plaintext(&mut v, &input.password);
    v.finish()?;

    user.password = Password::new(&input.password, state.config.bcrypt_cost).await?;

    let ttl = state.config.activation_token_ttl;
    let (user, token) = store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move {
            tx.insert_user(&mut user).await.map_err(duplicate_email)?;
            tx.grant_permissions(user.id, &[Permission::MoviesRead])
                .await?;

            let token = Token::generate(user.id, ttl, Scope::Activation);
            tx.insert_token(&token).await?;
            Ok::<_, AppError>((user, token))
        })
    })
    .await?;

    info!(user_id = user.id, "User registered");

    state.send_email(
        Template::UserWelcome,
        &user.email,
        TemplateData {
            user_id: user.id,
            token: token.plaintext,
            expiry: token.expiry,
        },
    );

    Ok((StatusCode::ACCEPTED, Json(json!({ "user": user }))))
}

/// `PUT /v1/users/activated`
#[instrument(skip(state, input))]
pub async fn activate_user(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<ActivateUserRequest>,
) -> AppResult<Json<Value>> {
    validate_token_plaintext(&input.token)?;

    let user = store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move {
            let mut user = tx
                .get_by_plaintext(Scope::Activation, &input.token)
                .await
                .map_err(invalid_token(Scope::Activation))?;

            user.activated = true;
            tx.update_user(&mut user).await?;
            tx.delete_all_for_user(Scope::Activation, user.id).await?;
            Ok::<_, AppError>(user)
        })
    })
    .await?;

    info!(user_id = user.id, "User activated");
    Ok(Json(json!({ "user": user })))
}

/// `PUT /v1/users/password`
///
/// Consumes a password-reset token. Outstanding authentication tokens are
/// revoked along with the reset tokens.
#[instrument(skip(state, input))]
pub async fn update_user_password(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<UpdatePasswordRequest>,
) -> AppResult<Json<Value>> {
    let mut v = Validator::new();
    validate_password_plaintext(&mut v, &input.password);
    v.finish()?;
    validate_token_plaintext(&input.token)?;

    let password = Password::new(&input.password, state.config.bcrypt_cost).await?;

    let user_id = store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move {
            let mut user = tx
                .get_by_plaintext(Scope::PasswordReset, &input.token)
                .await
                .map_err(invalid_token(Scope::PasswordReset))?;

            user.password = password;
            tx.update_user(&mut user).await?;
            tx.delete_all_for_user(Scope::PasswordReset, user.id).await?;
            tx.delete_all_for_user(Scope::Authentication, user.id).await?;
            Ok::<_, AppError>(user.id)
        })
    })
    .await?;

    info!(user_id, "Password reset");
    Ok(Json(json!({ "message": "your password was successfully reset" })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_email_maps_to_field_error() {
        let err = duplicate_email(AppError::ConstraintViolation(USERS_EMAIL_UNIQUE.into()));
        match err {
            AppError::FailedValidation(fields) => assert!(fields.contains_key("email")),
            other => panic!("unexpected {other:?}"),
        }

        let other = duplicate_email(AppError::ConstraintViolation("tokens_user_id_fkey".into()));
        assert!(matches!(other, AppError::ConstraintViolation(_)));
    }

    #[test]
    fn test_invalid_token_only_maps_not_found() {
        let err = invalid_token(Scope::Activation)(AppError::NotFound("token".into()));
        match err {
            AppError::FailedValidation(fields) => {
                assert_eq!(fields["token"], "invalid or expired activation token");
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = invalid_token(Scope::PasswordReset)(AppError::EditConflict("user".into()));
        assert!(matches!(err, AppError::EditConflict(_)));
    }
}
