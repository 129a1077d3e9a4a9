//! User accounts, password hashing and request identity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data::Permissions;
use crate::error::{AppError, AppResult};
use crate::validation::{Validator, is_email};

/// Bcrypt only reads the first 72 bytes; longer passwords are refused.
pub const MAX_PASSWORD_BYTES: usize = 72;
pub const MIN_PASSWORD_BYTES: usize = 8;
pub const MAX_NAME_BYTES: usize = 500;

pub const MIN_BCRYPT_COST: u32 = 4;
pub const MAX_BCRYPT_COST: u32 = 31;

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub email: String,
    #[serde(skip)]
    pub password: Password,
    pub activated: bool,
    #[serde(skip)]
    pub version: i32,
}

impl User {
    /// A not-yet-persisted user. `id`, `created_at` and `version` are
    /// assigned by the store on insert.
    pub fn new(name: String, email: String, password: Password) -> Self {
        Self {
            id: 0,
            created_at: Utc::now(),
            name,
            email,
            password,
            activated: false,
            version: 1,
        }
    }
}

/// A bcrypt password hash, optionally with the plaintext it was made from.
///
/// The plaintext is only kept between registration and validation of the
/// request and never leaves the process.
#[derive(Clone, Default)]
pub struct Password {
    plaintext: Option<String>,
    hash: String,
}

impl Password {
    /// Hash `plaintext` on the blocking pool.
    pub async fn new(plaintext: &str, cost: u32) -> AppResult<Self> {
        let owned = plaintext.to_string();
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(owned, cost))
            .await
            .map_err(|e| AppError::Internal(format!("Password hashing task failed: {e}")))?
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {e}")))?;

        Ok(Self {
            plaintext: Some(plaintext.to_string()),
            hash,
        })
    }

    /// Wrap a hash read back from the store.
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self {
            plaintext: None,
            hash: hash.into(),
        }
    }

    /// Check `candidate` against the hash on the blocking pool.
    pub async fn matches(&self, candidate: &str) -> AppResult<bool> {
        verify_blocking(candidate, &self.hash).await
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn plaintext(&self) -> Option<&str> {
        self.plaintext.as_deref()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password([redacted])")
    }
}

/// Run bcrypt verification off the async workers.
async fn verify_blocking(candidate: &str, hash: &str) -> AppResult<bool> {
    let candidate = candidate.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(candidate, &hash))
        .await
        .map_err(|e| AppError::Internal(format!("Password verification task failed: {e}")))?
        .map_err(|e| AppError::Internal(format!("Password verification failed: {e}")))
}

pub fn validate_email(v: &mut Validator, email: &str) {
    v.check(!email.is_empty(), "email", "must be provided");
    v.check(is_email(email), "email", "must be a valid email address");
}

pub fn validate_password_plaintext(v: &mut Validator, password: &str) {
    v.check(!password.is_empty(), "password", "must be provided");
    v.check(
        password.len() >= MIN_PASSWORD_BYTES,
        "password",
        "must be at least 8 bytes long",
    );
    v.check(
        password.len() <= MAX_PASSWORD_BYTES,
        "password",
        "must not be more than 72 bytes long",
    );
}

pub fn validate_user(v: &mut Validator, user: &User) {
    v.check(!user.name.is_empty(), "name", "must be provided");
    v.check(
        user.name.len() <= MAX_NAME_BYTES,
        "name",
        "must not be more than 500 bytes long",
    );

    validate_email(v, &user.email);

    if let Some(plaintext) = user.password.plaintext() {
        validate_password_plaintext(v, plaintext);
    }
}

/// Who is making the request.
///
/// Resolved once per request by the authenticator and stored in request
/// extensions; authorization reads it from there.
#[derive(Debug, Clone, Default)]
pub enum Identity {
    #[default]
    Anonymous,
    User {
        user: User,
        permissions: Permissions,
    },
}

impl Identity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Identity::Anonymous)
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Identity::Anonymous => None,
            Identity::User { user, .. } => Some(user),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const TEST_COST: u32 = MIN_BCRYPT_COST;

    #[tokio::test]
    async fn test_password_hash_and_match() {
        let password = Password::new("pa55word1234", TEST_COST).await.unwrap();
        assert!(password.hash().starts_with("$2"));
        assert!(password.matches("pa55word1234").await.unwrap());
        assert!(!password.matches("wrong-password").await.unwrap());
    }

    #[tokio::test]
    async fn test_from_hash_has_no_plaintext() {
        let hashed = Password::new("pa55word1234", TEST_COST).await.unwrap();
        let restored = Password::from_hash(hashed.hash());
        assert!(restored.plaintext().is_none());
        assert!(restored.matches("pa55word1234").await.unwrap());
    }

    #[test]
    fn test_password_debug_redacted() {
        let password = Password::from_hash("$2b$04$abcdefghijklmnopqrstuu");
        assert_eq!(format!("{password:?}"), "Password([redacted])");
    }

    #[test]
    fn test_validate_user_collects_all_fields() {
        let user = User::new(String::new(), "not-an-email".into(), Password::default());
        let mut v = Validator::new();
        validate_user(&mut v, &user);

        match v.finish() {
            Err(AppError::FailedValidation(fields)) => {
                assert_eq!(fields.get("name").unwrap(), "must be provided");
                assert_eq!(fields.get("email").unwrap(), "must be a valid email address");
                assert!(!fields.contains_key("password"));
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_password_bounds() {
        let mut v = Validator::new();
        validate_password_plaintext(&mut v, "short");
        assert!(!v.is_valid());

        let mut v = Validator::new();
        validate_password_plaintext(&mut v, &"x".repeat(73));
        assert!(!v.is_valid());

        let mut v = Validator::new();
        validate_password_plaintext(&mut v, &"x".repeat(72));
        assert!(v.is_valid());
    }

    #[test]
    fn test_user_json_hides_password_and_version() {
        let user = User::new("Alice".into(), "alice@example.com".into(), Password::default());
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("version").is_none());
        assert_eq!(json["activated"], false);
    }

    #[test]
    fn test_identity_default_is_anonymous() {
        assert!(Identity::default().is_anonymous());
        assert!(Identity::default().user().is_none());
    }
}
