//! Token issuance.
//!
//! - `POST /v1/tokens/authentication` - email + password for a bearer token
//! - `POST /v1/tokens/activation` - re-send an activation token
//! - `POST /v1/tokens/password-reset` - send a password reset token
//!
//! Plaintexts leave the process only in the response body or an email.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::data::users::{validate_email, validate_password_plaintext};
use crate::data::{Scope, Token, User};
use crate::error::{AppError, AppResult};
use crate::extract::JsonBody;
use crate::mailer::{Template, TemplateData};
use crate::state::AppState;
use crate::store;
use crate::validation::Validator;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

async fn find_user_by_email(state: &AppState, email: String) -> AppResult<Option<User>> {
    store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move {
            match tx.get_user_by_email(&email).await {
                Ok(user) => Ok(Some(user)),
                Err(AppError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
    })
    .await
}

async fn issue_token(state: &AppState, user_id: i64, scope: Scope) -> AppResult<Token> {
    let ttl = match scope {
        Scope::Activation => state.config.activation_token_ttl,
        Scope::Authentication => state.config.auth_token_ttl,
        Scope::PasswordReset => state.config.password_reset_token_ttl,
    };

    store::transaction(state.db.as_ref(), move |tx| {
        Box::pin(async move {
            let token = Token::generate(user_id, ttl, scope);
            tx.insert_token(&token).await?;
            Ok::<_, AppError>(token)
        })
    })
    .await
}

/// `POST /v1/tokens/authentication`
///
/// Unknown emails are checked against a dummy hash so both failure paths
/// take the same time.
#[instrument(skip(state, input))]
pub async fn create_authentication_token(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<CredentialsRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut v = Validator::new();
    validate_email(&mut v, &input.email);
    validate_password_plaintext(&mut v, &input.password);
    v.finish()?;

    let user = match find_user_by_email(&state, input.email).await? {
        Some(user) => {
            if !user.password.matches(&input.password).await? {
                warn!(user_id = user.id, "Authentication failed: wrong password");
                return Err(AppError::InvalidCredentials);
            }
            user
        }
        None => {
            state.dummy_password().await?.matches(&input.password).await?;
            warn!("Authentication failed: unknown email");
            return Err(AppError::InvalidCredentials);
        }
    };

    let token = issue_token(&state, user.id, Scope::Authentication).await?;
    info!(user_id = user.id, "Authentication token issued");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "authentication_token": token })),
    ))
}

/// `POST /v1/tokens/activation`
#[instrument(skip(state, input))]
pub async fn create_activation_token(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<EmailRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut v = Validator::new();
    validate_email(&mut v, &input.email);
    v.finish()?;

    let Some(user) = find_user_by_email(&state, input.email).await? else {
        return Err(AppError::failed_validation(
            "email",
            "no matching email address found",
        ));
    };

    if user.activated {
        return Err(AppError::failed_validation(
            "email",
            "user has already been activated",
        ));
    }

    let token = issue_token(&state, user.id, Scope::Activation).await?;

    state.send_email(
        Template::TokenActivation,
        &user.email,
        TemplateData {
            user_id: user.id,
            token: token.plaintext,
            expiry: token.expiry,
        },
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "an email will be sent to you containing activation instructions"
        })),
    ))
}

/// `POST /v1/tokens/password-reset`
#[instrument(skip(state, input))]
pub async fn create_password_reset_token(
    State(state): State<AppState>,
    JsonBody(input): JsonBody<EmailRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let mut v = Validator::new();
    validate_email(&mut v, &input.email);
    v.finish()?;

    let Some(user) = find_user_by_email(&state, input.email).await? else {
        return Err(AppError::failed_validation(
            "email",
            "no matching email address found",
        ));
    };

    if !user.activated {
        return Err(AppError::failed_validation(
            "email",
            "user account must be activated",
        ));
    }

    let token = issue_token(&state, user.id, Scope::PasswordReset).await?;

    state.send_email(
        Template::TokenPasswordReset,
        &user.email,
        TemplateData {
            user_id: user.id,
            token: token.plaintext,
            expiry: token.expiry,
        },
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "an email will be sent to you containing password reset instructions"
        })),
    ))
}
