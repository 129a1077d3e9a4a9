//! Request input validation.
//!
//! Validation collects one message per field and fails the request with
//! `AppError::FailedValidation` (422) so clients see every problem at once:
//!
//! ```rust,ignore
//! let mut v = Validator::new();
//! v.check(!name.is_empty(), "name", "must be provided");
//! v.check(name.len() <= 500, "name", "must not be more than 500 bytes long");
//! v.finish()?;
//! ```

use std::collections::HashSet;
use std::hash::Hash;

use crate::error::{AppError, AppResult, FieldErrors};

/// Maximum length of an email address (RFC 5321 path limit).
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Accumulates field-level validation failures.
#[derive(Debug, Default)]
pub struct Validator {
    errors: FieldErrors,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `message` for `field` unless `ok` holds.
    ///
    /// Only the first failure per field is kept.
    pub fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.add_error(field, message);
        }
    }

    pub fn add_error(&mut self, field: &str, message: &str) {
        self.errors
            .entry(field.to_string())
            .or_insert_with(|| message.to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Convert the collected failures into a result.
    pub fn finish(self) -> AppResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::FailedValidation(self.errors))
        }
    }
}

/// Whether `value` is one of `permitted`.
pub fn permitted_value<T: PartialEq>(value: &T, permitted: &[T]) -> bool {
    permitted.contains(value)
}

/// Whether every element of `values` is distinct.
pub fn unique<T: Eq + Hash>(values: &[T]) -> bool {
    let mut seen = HashSet::with_capacity(values.len());
    values.iter().all(|v| seen.insert(v))
}

/// Structural email check: `local@domain` with a dot-separated DNS domain.
///
/// Deliverability is the mailer's problem; this only rejects input that can
/// never be an address.
pub fn is_email(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.len() > MAX_EMAIL_LENGTH {
        return false;
    }

    let Some((local, domain)) = candidate.rsplit_once('@') else {
        return false;
    };

    let local_ok = !local.is_empty()
        && local.len() <= 64
        && !local.starts_with('.')
        && !local.ends_with('.')
        && !local.contains("..")
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ".!#$%&'*+/=?^_`{|}~-".contains(c));

    let domain_ok = !domain.is_empty()
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });

    local_ok && domain_ok
}
