//! Opaque bearer tokens.
//!
//! A token is 16 bytes from the OS-seeded CSPRNG, rendered as unpadded
//! RFC 4648 base32 (26 characters). Only the SHA-256 fingerprint of the
//! plaintext is ever persisted; the plaintext lives in the response body that
//! hands it to the client and nowhere else.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use data_encoding::BASE32_NOPAD;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Length of a token plaintext in characters.
pub const TOKEN_PLAINTEXT_LEN: usize = 26;

/// Random bytes behind every token (128 bits of entropy).
pub const TOKEN_ENTROPY_BYTES: usize = 16;

/// What a token may be used for.
///
/// A token issued for one scope is never accepted for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Activation,
    Authentication,
    PasswordReset,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Activation => "activation",
            Scope::Authentication => "authentication",
            Scope::PasswordReset => "password-reset",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A freshly issued token.
///
/// Serializes to `{"token": "...", "expiry": "..."}` for the client.
#[derive(Clone, Serialize)]
pub struct Token {
    #[serde(rename = "token")]
    pub plaintext: String,
    #[serde(skip)]
    pub fingerprint: [u8; 32],
    #[serde(skip)]
    pub user_id: i64,
    pub expiry: DateTime<Utc>,
    #[serde(skip)]
    pub scope: Scope,
}

impl Token {
    /// Issue a new token for `user_id` valid for `ttl` from now.
    pub fn generate(user_id: i64, ttl: Duration, scope: Scope) -> Self {
        let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
        rand::rng().fill_bytes(&mut bytes);

        let plaintext = BASE32_NOPAD.encode(&bytes);
        let fingerprint = fingerprint(&plaintext);

        let expiry = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            plaintext,
            fingerprint,
            user_id,
            expiry,
            scope,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("plaintext", &"[redacted]")
            .field("user_id", &self.user_id)
            .field("expiry", &self.expiry)
            .field("scope", &self.scope)
            .finish()
    }
}

/// SHA-256 of the plaintext. Deterministic, one-way.
pub fn fingerprint(plaintext: &str) -> [u8; 32] {
    Sha256::digest(plaintext.as_bytes()).into()
}

/// Shape check for a client-supplied plaintext.
pub fn is_well_formed(plaintext: &str) -> bool {
    plaintext.len() == TOKEN_PLAINTEXT_LEN
        && plaintext
            .bytes()
            .all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b))
}
