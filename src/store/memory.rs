//! In-process store.
//!
//! A transaction holds the single state lock for its lifetime and works on a
//! private copy; commit writes the copy back. Transactions are therefore
//! serializable and a dropped transaction leaves no trace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;

use crate::data::{Metadata, Movie, MovieQuery, Permission, Permissions, Scope, Token, User};
use crate::data::tokens::fingerprint;
use crate::error::{AppError, AppResult};
use crate::store::{
    DEFAULT_QUERY_TIMEOUT, Database, MovieStore, PermissionStore, TokenStore, Transaction,
    USERS_EMAIL_UNIQUE, UserStore,
};

const TOKENS_USER_FK: &str = "tokens_user_id_fkey";
const USERS_PERMISSIONS_USER_FK: &str = "users_permissions_user_id_fkey";

#[derive(Debug, Clone)]
struct StoredToken {
    fingerprint: [u8; 32],
    user_id: i64,
    expiry: DateTime<Utc>,
    scope: Scope,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: BTreeMap<i64, User>,
    tokens: Vec<StoredToken>,
    permissions: BTreeMap<i64, BTreeSet<Permission>>,
    movies: BTreeMap<i64, Movie>,
    next_user_id: i64,
    next_movie_id: i64,
}

#[derive(Clone)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    timeout: Duration,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_QUERY_TIMEOUT)
    }

    /// `timeout` bounds how long `begin` waits for the state lock.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            timeout,
        }
    }

    /// Number of stored tokens. Expired ones linger until the next insert.
    pub async fn token_count(&self) -> usize {
        self.state.lock().await.tokens.len()
    }

    /// Move every stored expiry of `scope` for `user_id` to `expiry`.
    pub async fn set_token_expiry(&self, scope: Scope, user_id: i64, expiry: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        for token in state
            .tokens
            .iter_mut()
            .filter(|t| t.scope == scope && t.user_id == user_id)
        {
            token.expiry = expiry;
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> AppResult<Box<dyn Transaction>> {
        let guard = timeout(self.timeout, self.state.clone().lock_owned())
            .await
            .map_err(|_| AppError::OperationTimeout("begin transaction".to_string()))?;
        let working = guard.clone();

        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }

    async fn close(&self) {}

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryTransaction {
    fn email_taken(&self, email: &str, except_id: Option<i64>) -> bool {
        self.working
            .users
            .values()
            .any(|u| Some(u.id) != except_id && u.email.eq_ignore_ascii_case(email))
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryTransaction {
    async fn insert_user(&mut self, user: &mut User) -> AppResult<()> {
        if self.email_taken(&user.email, None) {
            return Err(AppError::ConstraintViolation(USERS_EMAIL_UNIQUE.to_string()));
        }

        self.working.next_user_id += 1;
        user.id = self.working.next_user_id;
        user.created_at = Utc::now();
        user.version = 1;
        self.working.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user_by_email(&mut self, email: &str) -> AppResult<User> {
        self.working
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or_else(|| AppError::NotFound("user".to_string()))
    }

    async fn update_user(&mut self, user: &mut User) -> AppResult<()> {
        if self.email_taken(&user.email, Some(user.id)) {
            return Err(AppError::ConstraintViolation(USERS_EMAIL_UNIQUE.to_string()));
        }

        let stored = self
            .working
            .users
            .get_mut(&user.id)
            .filter(|stored| stored.version == user.version)
            .ok_or_else(|| AppError::EditConflict(format!("user {}", user.id)))?;

        user.version += 1;
        *stored = user.clone();
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryTransaction {
    async fn insert_token(&mut self, token: &Token) -> AppResult<()> {
        if !self.working.users.contains_key(&token.user_id) {
            return Err(AppError::ConstraintViolation(TOKENS_USER_FK.to_string()));
        }

        // Expired rows can never match again
        let now = Utc::now();
        self.working.tokens.retain(|t| t.expiry > now);
        self.working.tokens.push(StoredToken {
            fingerprint: token.fingerprint,
            user_id: token.user_id,
            expiry: token.expiry,
            scope: token.scope,
        });
        Ok(())
    }

    async fn get_by_plaintext(&mut self, scope: Scope, plaintext: &str) -> AppResult<User> {
        let wanted = fingerprint(plaintext);
        let now = Utc::now();

        self.working
            .tokens
            .iter()
            .filter(|t| t.scope == scope && t.expiry > now)
            .find(|t| bool::from(t.fingerprint.ct_eq(&wanted)))
            .and_then(|t| self.working.users.get(&t.user_id))
            .cloned()
            .ok_or_else(|| AppError::NotFound("token".to_string()))
    }

    async fn delete_all_for_user(&mut self, scope: Scope, user_id: i64) -> AppResult<()> {
        self.working
            .tokens
            .retain(|t| !(t.scope == scope && t.user_id == user_id));
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for MemoryTransaction {
    async fn get_permissions_for_user(&mut self, user_id: i64) -> AppResult<Permissions> {
        Ok(self
            .working
            .permissions
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn grant_permissions(
        &mut self,
        user_id: i64,
        permissions: &[Permission],
    ) -> AppResult<()> {
        if !self.working.users.contains_key(&user_id) {
            return Err(AppError::ConstraintViolation(
                USERS_PERMISSIONS_USER_FK.to_string(),
            ));
        }

        self.working
            .permissions
            .entry(user_id)
            .or_default()
            .extend(permissions.iter().copied());
        Ok(())
    }
}

fn title_matches(title: &str, query: &str) -> bool {
    let words: Vec<String> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .all(|q| words.iter().any(|w| *w == q.to_lowercase()))
}

#[async_trait]
impl MovieStore for MemoryTransaction {
    async fn insert_movie(&mut self, movie: &mut Movie) -> AppResult<()> {
        self.working.next_movie_id += 1;
        movie.id = self.working.next_movie_id;
        movie.created_at = Utc::now();
        movie.version = 1;
        self.working.movies.insert(movie.id, movie.clone());
        Ok(())
    }

    async fn get_movie(&mut self, id: i64) -> AppResult<Movie> {
        self.working
            .movies
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("movie {id}")))
    }

    async fn update_movie(&mut self, movie: &mut Movie) -> AppResult<()> {
        let stored = self
            .working
            .movies
            .get_mut(&movie.id)
            .filter(|stored| stored.version == movie.version)
            .ok_or_else(|| AppError::EditConflict(format!("movie {}", movie.id)))?;

        movie.version += 1;
        *stored = movie.clone();
        Ok(())
    }

    async fn delete_movie(&mut self, id: i64) -> AppResult<()> {
        self.working
            .movies
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::NotFound(format!("movie {id}")))
    }

    async fn list_movies(&mut self, query: &MovieQuery) -> AppResult<(Vec<Movie>, Metadata)> {
        let filters = &query.filters;

        let mut matching: Vec<&Movie> = self
            .working
            .movies
            .values()
            .filter(|m| title_matches(&m.title, &query.title))
            .filter(|m| query.genres.iter().all(|g| m.genres.contains(g)))
            .collect();

        let column = filters.sort_column().unwrap_or("id");
        matching.sort_by(|a, b| {
            let primary = match column {
                "title" => a.title.cmp(&b.title),
                "year" => a.year.cmp(&b.year),
                "runtime" => a.runtime.cmp(&b.runtime),
                _ => a.id.cmp(&b.id),
            };
            let primary = if filters.descending() {
                primary.reverse()
            } else {
                primary
            };
            primary.then(a.id.cmp(&b.id))
        });

        let total = matching.len() as u64;
        let offset = usize::try_from(filters.offset()).unwrap_or(usize::MAX);
        let page: Vec<Movie> = matching
            .into_iter()
            .skip(offset)
            .take(filters.limit() as usize)
            .cloned()
            .collect();

        Ok((
            page,
            Metadata::calculate(total, filters.page, filters.page_size),
        ))
    }
}
