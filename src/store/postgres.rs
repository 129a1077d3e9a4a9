//! PostgreSQL store backed by an sqlx pool.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, Postgres};
use tokio::time::timeout;
use tracing::info;

use crate::data::{Metadata, Movie, MovieQuery, Password, Permission, Permissions, Scope, Token, User};
use crate::data::tokens::fingerprint;
use crate::error::{AppError, AppResult};
use crate::store::{Database, MovieStore, PermissionStore, TokenStore, Transaction, UserStore};

/// Pool and deadline settings.
#[derive(Clone)]
pub struct PgSettings {
    pub url: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub max_idle_time: Duration,
    pub query_timeout: Duration,
}

// The URL may carry credentials.
impl std::fmt::Debug for PgSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgSettings")
            .field("url", &"[redacted]")
            .field("max_open_conns", &self.max_open_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_idle_time", &self.max_idle_time)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    query_timeout: Duration,
}

impl PgDatabase {
    /// Open the pool and verify connectivity within the query timeout.
    ///
    /// `max_idle_conns` is kept warm as the pool minimum, capped at
    /// `max_open_conns`.
    pub async fn connect(settings: &PgSettings) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_open_conns)
            .min_connections(settings.max_idle_conns.min(settings.max_open_conns))
            .idle_timeout(settings.max_idle_time)
            .acquire_timeout(settings.query_timeout)
            .connect_lazy(&settings.url)
            .map_err(|e| AppError::Config(format!("Invalid DATABASE_URL: {e}")))?;

        let db = Self {
            pool,
            query_timeout: settings.query_timeout,
        };
        db.ping().await?;

        info!(
            max_open = settings.max_open_conns,
            max_idle = settings.max_idle_conns,
            "Connected to PostgreSQL"
        );
        Ok(db)
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(format!("Migration failed: {e}")))?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> AppResult<Box<dyn Transaction>> {
        let tx = deadline(self.query_timeout, "begin transaction", self.pool.begin()).await?;
        Ok(Box::new(PgTransaction {
            tx,
            timeout: self.query_timeout,
        }))
    }

    async fn ping(&self) -> AppResult<()> {
        deadline(self.query_timeout, "ping", async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await
        })
        .await
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Bound `fut` by `limit` and classify its error.
async fn deadline<T, F>(limit: Duration, op: &'static str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result.map_err(|e| classify(op, e)),
        Err(_) => Err(AppError::OperationTimeout(op.to_string())),
    }
}

fn classify(op: &str, err: sqlx::Error) -> AppError {
    match err {
        sqlx::Error::RowNotFound => AppError::NotFound(op.to_string()),
        sqlx::Error::PoolTimedOut => AppError::OperationTimeout(op.to_string()),
        sqlx::Error::Database(db)
            if db.is_unique_violation() || db.is_foreign_key_violation() =>
        {
            AppError::ConstraintViolation(db.constraint().unwrap_or("unknown").to_string())
        }
        other => AppError::Database(format!("{op}: {other}")),
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    created_at: DateTime<Utc>,
    name: String,
    email: String,
    password_hash: String,
    activated: bool,
    version: i32,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            created_at: row.created_at,
            name: row.name,
            email: row.email,
            password: Password::from_hash(row.password_hash),
            activated: row.activated,
            version: row.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MovieRow {
    id: i64,
    created_at: DateTime<Utc>,
    title: String,
    year: i32,
    runtime: i32,
    genres: Vec<String>,
    version: i32,
}

impl From<MovieRow> for Movie {
    fn from(row: MovieRow) -> Self {
        Movie {
            id: row.id,
            created_at: row.created_at,
            title: row.title,
            year: row.year,
            runtime: row.runtime,
            genres: row.genres,
            version: row.version,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CountedMovieRow {
    total_records: i64,
    #[sqlx(flatten)]
    movie: MovieRow,
}

struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
    timeout: Duration,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn commit(self: Box<Self>) -> AppResult<()> {
        let PgTransaction { tx, timeout } = *self;
        deadline(timeout, "commit", tx.commit()).await
    }

    async fn rollback(self: Box<Self>) -> AppResult<()> {
        let PgTransaction { tx, timeout } = *self;
        deadline(timeout, "rollback", tx.rollback()).await
    }
}

#[async_trait]
impl UserStore for PgTransaction {
    async fn insert_user(&mut self, user: &mut User) -> AppResult<()> {
        let (id, created_at, version): (i64, DateTime<Utc>, i32) = deadline(
            self.timeout,
            "insert user",
            sqlx::query_as(
                r#"
                INSERT INTO users (name, email, password_hash, activated)
                VALUES ($1, $2, $3, $4)
                RETURNING id, created_at, version
                "#,
            )
            .bind(&user.name)
            .bind(&user.email)
            .bind(user.password.hash())
            .bind(user.activated)
            .fetch_one(&mut *self.tx),
        )
        .await?;

        user.id = id;
        user.created_at = created_at;
        user.version = version;
        Ok(())
    }

    async fn get_user_by_email(&mut self, email: &str) -> AppResult<User> {
        let row: UserRow = deadline(
            self.timeout,
            "user",
            sqlx::query_as(
                r#"
                SELECT id, created_at, name, email::text AS email, password_hash, activated, version
                FROM users
                WHERE email = $1::citext
                "#,
            )
            .bind(email)
            .fetch_one(&mut *self.tx),
        )
        .await?;

        Ok(row.into())
    }

    async fn update_user(&mut self, user: &mut User) -> AppResult<()> {
        let version: Option<i32> = deadline(
            self.timeout,
            "update user",
            sqlx::query_scalar(
                r#"
                UPDATE users
                SET name = $1, email = $2, password_hash = $3, activated = $4, version = version + 1
                WHERE id = $5 AND version = $6
                RETURNING version
                "#,
            )
            .bind(&user.name)
            .bind(&user.email)
            .bind(user.password.hash())
            .bind(user.activated)
            .bind(user.id)
            .bind(user.version)
            .fetch_optional(&mut *self.tx),
        )
        .await?;

        user.version =
            version.ok_or_else(|| AppError::EditConflict(format!("user {}", user.id)))?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgTransaction {
    async fn insert_token(&mut self, token: &Token) -> AppResult<()> {
        deadline(
            self.timeout,
            "insert token",
            sqlx::query(
                r#"
                INSERT INTO tokens (hash, user_id, expiry, scope)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(token.fingerprint.to_vec())
            .bind(token.user_id)
            .bind(token.expiry)
            .bind(token.scope.as_str())
            .execute(&mut *self.tx),
        )
        .await?;
        Ok(())
    }

    async fn get_by_plaintext(&mut self, scope: Scope, plaintext: &str) -> AppResult<User> {
        let hash = fingerprint(plaintext);

        let row: UserRow = deadline(
            self.timeout,
            "token",
            sqlx::query_as(
                r#"
                SELECT users.id, users.created_at, users.name, users.email::text AS email,
                       users.password_hash, users.activated, users.version
                FROM users
                INNER JOIN tokens ON users.id = tokens.user_id
                WHERE tokens.hash = $1
                  AND tokens.scope = $2
                  AND tokens.expiry > $3
                "#,
            )
            .bind(hash.to_vec())
            .bind(scope.as_str())
            .bind(Utc::now())
            .fetch_one(&mut *self.tx),
        )
        .await?;

        Ok(row.into())
    }

    async fn delete_all_for_user(&mut self, scope: Scope, user_id: i64) -> AppResult<()> {
        deadline(
            self.timeout,
            "delete tokens",
            sqlx::query("DELETE FROM tokens WHERE scope = $1 AND user_id = $2")
                .bind(scope.as_str())
                .bind(user_id)
                .execute(&mut *self.tx),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for PgTransaction {
    async fn get_permissions_for_user(&mut self, user_id: i64) -> AppResult<Permissions> {
        let codes: Vec<String> = deadline(
            self.timeout,
            "permissions",
            sqlx::query_scalar(
                r#"
                SELECT permissions.code
                FROM permissions
                INNER JOIN users_permissions ON users_permissions.permission_id = permissions.id
                WHERE users_permissions.user_id = $1
                "#,
            )
            .bind(user_id)
            .fetch_all(&mut *self.tx),
        )
        .await?;

        Ok(Permissions::from_codes(codes))
    }

    async fn grant_permissions(
        &mut self,
        user_id: i64,
        permissions: &[Permission],
    ) -> AppResult<()> {
        let codes: Vec<&'static str> = permissions.iter().map(|p| p.code()).collect();

        deadline(
            self.timeout,
            "grant permissions",
            sqlx::query(
                r#"
                INSERT INTO users_permissions (user_id, permission_id)
                SELECT $1, permissions.id FROM permissions WHERE permissions.code = ANY($2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(user_id)
            .bind(codes)
            .execute(&mut *self.tx),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MovieStore for PgTransaction {
    async fn insert_movie(&mut self, movie: &mut Movie) -> AppResult<()> {
        let (id, created_at, version): (i64, DateTime<Utc>, i32) = deadline(
            self.timeout,
            "insert movie",
            sqlx::query_as(
                r#"
                INSERT INTO movies (title, year, runtime, genres)
                VALUES ($1, $2, $3, $4)
                RETURNING id, created_at, version
                "#,
            )
            .bind(&movie.title)
            .bind(movie.year)
            .bind(movie.runtime)
            .bind(&movie.genres)
            .fetch_one(&mut *self.tx),
        )
        .await?;

        movie.id = id;
        movie.created_at = created_at;
        movie.version = version;
        Ok(())
    }

    async fn get_movie(&mut self, id: i64) -> AppResult<Movie> {
        let row: MovieRow = deadline(
            self.timeout,
            "movie",
            sqlx::query_as(
                r#"
                SELECT id, created_at, title, year, runtime, genres, version
                FROM movies
                WHERE id = $1
                "#,
            )
            .bind(id)
            .fetch_one(&mut *self.tx),
        )
        .await?;

        Ok(row.into())
    }

    async fn update_movie(&mut self, movie: &mut Movie) -> AppResult<()> {
        let version: Option<i32> = deadline(
            self.timeout,
            "update movie",
            sqlx::query_scalar(
                r#"
                UPDATE movies
                SET title = $1, year = $2, runtime = $3, genres = $4, version = version + 1
                WHERE id = $5 AND version = $6
                RETURNING version
                "#,
            )
            .bind(&movie.title)
            .bind(movie.year)
            .bind(movie.runtime)
            .bind(&movie.genres)
            .bind(movie.id)
            .bind(movie.version)
            .fetch_optional(&mut *self.tx),
        )
        .await?;

        movie.version =
            version.ok_or_else(|| AppError::EditConflict(format!("movie {}", movie.id)))?;
        Ok(())
    }

    async fn delete_movie(&mut self, id: i64) -> AppResult<()> {
        let result = deadline(
            self.timeout,
            "delete movie",
            sqlx::query("DELETE FROM movies WHERE id = $1")
                .bind(id)
                .execute(&mut *self.tx),
        )
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("movie {id}")));
        }
        Ok(())
    }

    async fn list_movies(&mut self, query: &MovieQuery) -> AppResult<(Vec<Movie>, Metadata)> {
        let filters = &query.filters;
        let column = filters.sort_column().unwrap_or("id");
        let direction = if filters.descending() { "DESC" } else { "ASC" };

        // `column` comes from the sort safelist, never from raw input
        let sql = format!(
            r#"
            SELECT count(*) OVER() AS total_records,
                   id, created_at, title, year, runtime, genres, version
            FROM movies
            WHERE (to_tsvector('simple', title) @@ plainto_tsquery('simple', $1) OR $1 = '')
              AND (genres @> $2 OR $2 = '{{}}')
            ORDER BY {column} {direction}, id ASC
            LIMIT $3 OFFSET $4
            "#
        );

        let rows: Vec<CountedMovieRow> = deadline(
            self.timeout,
            "list movies",
            sqlx::query_as(&sql)
                .bind(&query.title)
                .bind(&query.genres)
                .bind(i64::from(filters.limit()))
                .bind(i64::try_from(filters.offset()).unwrap_or(i64::MAX))
                .fetch_all(&mut *self.tx),
        )
        .await?;

        let total = rows
            .first()
            .map(|r| u64::try_from(r.total_records).unwrap_or(0))
            .unwrap_or(0);
        let movies = rows.into_iter().map(|r| r.movie.into()).collect();

        Ok((
            movies,
            Metadata::calculate(total, filters.page, filters.page_size),
        ))
    }
}
