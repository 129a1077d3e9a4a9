//! Persistence behind object-safe traits.
//!
//! Every store operation runs on a [`Transaction`] obtained from a
//! [`Database`]. Handlers never begin or commit by hand; multi-step work goes
//! through [`transaction`], which commits exactly once when the body returns
//! `Ok` and rolls back otherwise:
//!
//! ```rust,ignore
//! let user = store::transaction(db.as_ref(), move |tx| {
//!     Box::pin(async move {
//!         tx.insert_user(&mut user).await?;
//!         tx.insert_token(&token).await?;
//!         Ok::<_, AppError>(user)
//!     })
//! })
//! .await?;
//! ```
//!
//! Two implementations exist: [`postgres::PgDatabase`] for deployments and
//! [`memory::MemoryDatabase`] for tests and DSN-less development.

pub mod memory;
pub mod postgres;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::data::{Metadata, Movie, MovieQuery, Permission, Permissions, Scope, Token, User};
use crate::error::AppResult;

pub use memory::MemoryDatabase;
pub use postgres::{PgDatabase, PgSettings};

/// Unique constraint on `users.email`.
pub const USERS_EMAIL_UNIQUE: &str = "users_email_key";

/// Default per-operation deadline.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[async_trait]
pub trait UserStore: Send {
    /// Insert and fill in `id`, `created_at` and `version`.
    ///
    /// A duplicate email fails with `ConstraintViolation(USERS_EMAIL_UNIQUE)`.
    async fn insert_user(&mut self, user: &mut User) -> AppResult<()>;

    async fn get_user_by_email(&mut self, email: &str) -> AppResult<User>;

    /// Optimistic update keyed on `(id, version)`; bumps `user.version`.
    ///
    /// A stale version fails with `EditConflict`.
    async fn update_user(&mut self, user: &mut User) -> AppResult<()>;
}

#[async_trait]
pub trait TokenStore: Send {
    /// Persist fingerprint, user, expiry and scope. Never the plaintext.
    ///
    /// Fails with `ConstraintViolation` if the user does not exist.
    async fn insert_token(&mut self, token: &Token) -> AppResult<()>;

    /// User owning a non-expired token of `scope` matching `plaintext`.
    ///
    /// `NotFound` covers both unknown and expired tokens.
    async fn get_by_plaintext(&mut self, scope: Scope, plaintext: &str) -> AppResult<User>;

    /// Remove every token of `scope` for `user_id`. Idempotent.
    async fn delete_all_for_user(&mut self, scope: Scope, user_id: i64) -> AppResult<()>;
}

#[async_trait]
pub trait PermissionStore: Send {
    async fn get_permissions_for_user(&mut self, user_id: i64) -> AppResult<Permissions>;

    /// Grant `permissions` to `user_id`. Already-held permissions are ignored.
    async fn grant_permissions(&mut self, user_id: i64, permissions: &[Permission])
    -> AppResult<()>;
}

#[async_trait]
pub trait MovieStore: Send {
    async fn insert_movie(&mut self, movie: &mut Movie) -> AppResult<()>;

    async fn get_movie(&mut self, id: i64) -> AppResult<Movie>;

    /// Optimistic update keyed on `(id, version)`; bumps `movie.version`.
    async fn update_movie(&mut self, movie: &mut Movie) -> AppResult<()>;

    async fn delete_movie(&mut self, id: i64) -> AppResult<()>;

    async fn list_movies(&mut self, query: &MovieQuery) -> AppResult<(Vec<Movie>, Metadata)>;
}

/// A unit of work against the store.
///
/// Dropping a transaction without committing discards its changes.
#[async_trait]
pub trait Transaction: UserStore + TokenStore + PermissionStore + MovieStore {
    async fn commit(self: Box<Self>) -> AppResult<()>;

    async fn rollback(self: Box<Self>) -> AppResult<()>;
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn begin(&self) -> AppResult<Box<dyn Transaction>>;

    /// Round-trip to the backend under the query deadline.
    async fn ping(&self) -> AppResult<()>;

    async fn close(&self);

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

/// Run `work` inside a transaction.
///
/// Commits once if `work` returns `Ok`, rolls back if it returns `Err`. A
/// failed rollback is logged; the original error is returned.
pub async fn transaction<T, F>(db: &dyn Database, work: F) -> AppResult<T>
where
    F: for<'t> FnOnce(&'t mut dyn Transaction) -> BoxFuture<'t, AppResult<T>>,
{
    let mut tx = db.begin().await?;

    match work(tx.as_mut()).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(
                    error = %rollback_err,
                    original = %err,
                    backend = db.backend(),
                    "Transaction rollback failed"
                );
            }
            Err(err)
        }
    }
}
