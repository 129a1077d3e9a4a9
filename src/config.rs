//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults
//! suitable for development. A `.env` file in the working directory is read
//! first when present.
//!
//! # Store Selection
//!
//! - `DATABASE_URL` set: PostgreSQL pool (`DB_*` variables tune it)
//! - `DATABASE_URL` unset: in-memory store, refused when `APP_ENV=production`
//!
//! # Control Plane
//!
//! - `LIMITER_RPS` / `LIMITER_BURST` / `LIMITER_ENABLED`: per-client token bucket
//! - `LIMITER_SWEEP_INTERVAL_SECS` / `LIMITER_STALE_AFTER_SECS`: idle eviction
//! - `AUTH_FAILURE_LIMIT_PER_MINUTE` / `AUTH_FAILURE_BURST`: failed bearer token guard
//! - `TRUSTED_PROXIES`: CIDRs whose forwarding headers are believed
//!
//! # Lifecycle
//!
//! - `SHUTDOWN_GRACE_PERIOD_SECS`: in-flight request allowance after a signal
//! - `TASK_DRAIN_TIMEOUT_SECS`: background task allowance after the server stops

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::data::users::{MAX_BCRYPT_COST, MIN_BCRYPT_COST};
use crate::error::{AppError, AppResult};
use crate::mailer::SmtpSettings;
use crate::middleware::{RateLimitConfig, TrustedProxyConfig};
use crate::store::PgSettings;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }

    pub fn is_production(self) -> bool {
        self == Self::Production
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "unknown environment '{other}' (expected development|staging|production)"
            )),
        }
    }
}

/// PostgreSQL DSN. May carry credentials, so `Debug` hides it.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseUrl(pub String);

impl fmt::Debug for DatabaseUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DatabaseUrl([redacted])")
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 4000)
    pub port: u16,

    pub environment: Environment,

    // =========================================================================
    // Store Configuration
    // =========================================================================
    /// PostgreSQL DSN; `None` selects the in-memory store.
    pub database_url: Option<DatabaseUrl>,

    pub db_max_open_conns: u32,

    /// Connections kept warm in the pool (capped at `db_max_open_conns`)
    pub db_max_idle_conns: u32,

    pub db_max_idle_time: Duration,

    /// Deadline for every store operation and for the startup ping
    pub db_query_timeout: Duration,

    pub db_run_migrations: bool,

    // =========================================================================
    // Control Plane Configuration
    // =========================================================================
    pub limiter: RateLimitConfig,

    /// Failed bearer tokens allowed per client per minute (0 disables the guard)
    pub auth_failure_limit_per_minute: u32,

    pub auth_failure_burst: u32,

    /// Trusted proxy CIDR ranges.
    ///
    /// Forwarding headers are only believed when the connection comes from
    /// one of these networks. Empty means the peer address is always used.
    pub trusted_proxies: Vec<String>,

    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    // =========================================================================
    // Accounts
    // =========================================================================
    pub bcrypt_cost: u32,

    pub activation_token_ttl: Duration,

    pub auth_token_ttl: Duration,

    pub password_reset_token_ttl: Duration,

    pub smtp: SmtpSettings,

    // =========================================================================
    // Lifecycle
    // =========================================================================
    pub shutdown_grace_period: Duration,

    pub task_drain_timeout: Duration,

    /// Interval for the background store ping (zero disables it)
    pub health_check_interval: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a value does not parse or the resulting
    /// configuration is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 4000)?,
            environment: Self::parse_env("APP_ENV", Environment::Development)?,

            // Store
            database_url: env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty())
                .map(DatabaseUrl),
            db_max_open_conns: Self::parse_env("DB_MAX_OPEN_CONNS", 25)?,
            db_max_idle_conns: Self::parse_env("DB_MAX_IDLE_CONNS", 25)?,
            db_max_idle_time: Duration::from_secs(Self::parse_env("DB_MAX_IDLE_TIME_SECS", 900)?),
            db_query_timeout: Duration::from_secs(Self::parse_env("DB_QUERY_TIMEOUT_SECS", 5)?),
            db_run_migrations: Self::parse_env("DB_RUN_MIGRATIONS", true)?,

            // Control plane
            limiter: RateLimitConfig {
                rps: Self::parse_env("LIMITER_RPS", 2.0)?,
                burst: Self::parse_env("LIMITER_BURST", 4)?,
                enabled: Self::parse_env("LIMITER_ENABLED", true)?,
                sweep_interval: Duration::from_secs(Self::parse_env(
                    "LIMITER_SWEEP_INTERVAL_SECS",
                    60,
                )?),
                stale_after: Duration::from_secs(Self::parse_env("LIMITER_STALE_AFTER_SECS", 180)?),
            },
            auth_failure_limit_per_minute: Self::parse_env("AUTH_FAILURE_LIMIT_PER_MINUTE", 10)?,
            auth_failure_burst: Self::parse_env("AUTH_FAILURE_BURST", 5)?,
            trusted_proxies: parse_list(&env::var("TRUSTED_PROXIES").unwrap_or_default()),
            cors_allowed_origins: parse_list(
                &env::var("CORS_ALLOWED_ORIGINS").unwrap_or_else(|_| "*".to_string()),
            ),
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,

            // Accounts
            bcrypt_cost: Self::parse_env("BCRYPT_COST", bcrypt::DEFAULT_COST)?,
            activation_token_ttl: Duration::from_secs(Self::parse_env(
                "ACTIVATION_TOKEN_TTL_SECS",
                3 * 24 * 60 * 60,
            )?),
            auth_token_ttl: Duration::from_secs(Self::parse_env(
                "AUTH_TOKEN_TTL_SECS",
                24 * 60 * 60,
            )?),
            password_reset_token_ttl: Duration::from_secs(Self::parse_env(
                "PASSWORD_RESET_TOKEN_TTL_SECS",
                45 * 60,
            )?),
            smtp: SmtpSettings {
                host: env::var("SMTP_HOST").ok().filter(|h| !h.is_empty()),
                port: Self::parse_env("SMTP_PORT", 25)?,
                username: env::var("SMTP_USERNAME").ok().filter(|u| !u.is_empty()),
                password: env::var("SMTP_PASSWORD").ok().filter(|p| !p.is_empty()),
                sender: env::var("SMTP_SENDER")
                    .unwrap_or_else(|_| "Movie Catalog <no-reply@movie-catalog.local>".to_string()),
            },

            // Lifecycle
            shutdown_grace_period: Duration::from_secs(Self::parse_env(
                "SHUTDOWN_GRACE_PERIOD_SECS",
                20,
            )?),
            task_drain_timeout: Duration::from_secs(Self::parse_env("TASK_DRAIN_TIMEOUT_SECS", 20)?),
            health_check_interval: Duration::from_secs(Self::parse_env(
                "HEALTH_CHECK_INTERVAL_SECS",
                30,
            )?),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        self.limiter
            .validate()
            .map_err(|e| AppError::Config(format!("Invalid limiter settings: {e}")))?;

        if self.db_max_open_conns == 0 {
            return Err(AppError::Config(
                "DB_MAX_OPEN_CONNS must be greater than 0".to_string(),
            ));
        }

        if self.db_max_idle_conns > self.db_max_open_conns {
            return Err(AppError::Config(format!(
                "DB_MAX_IDLE_CONNS ({}) must be <= DB_MAX_OPEN_CONNS ({})",
                self.db_max_idle_conns, self.db_max_open_conns
            )));
        }

        if self.db_query_timeout.is_zero() {
            return Err(AppError::Config(
                "DB_QUERY_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }

        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&self.bcrypt_cost) {
            return Err(AppError::Config(format!(
                "BCRYPT_COST must be between {MIN_BCRYPT_COST} and {MAX_BCRYPT_COST}"
            )));
        }

        for (name, ttl) in [
            ("ACTIVATION_TOKEN_TTL_SECS", self.activation_token_ttl),
            ("AUTH_TOKEN_TTL_SECS", self.auth_token_ttl),
            ("PASSWORD_RESET_TOKEN_TTL_SECS", self.password_reset_token_ttl),
        ] {
            if ttl.is_zero() {
                return Err(AppError::Config(format!("{name} must be greater than 0")));
            }
        }

        // Validate max request body size is reasonable
        if self.max_request_body_size == 0 {
            return Err(AppError::Config(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.environment.is_production() && self.database_url.is_none() {
            return Err(AppError::Config(
                "DATABASE_URL is required when APP_ENV=production".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Pool settings, or `None` when the in-memory store is selected.
    pub fn pg_settings(&self) -> Option<PgSettings> {
        self.database_url.as_ref().map(|DatabaseUrl(url)| PgSettings {
            url: url.clone(),
            max_open_conns: self.db_max_open_conns,
            max_idle_conns: self.db_max_idle_conns,
            max_idle_time: self.db_max_idle_time,
            query_timeout: self.db_query_timeout,
        })
    }

    pub fn trusted_proxy_config(&self) -> TrustedProxyConfig {
        TrustedProxyConfig::new(&self.trusted_proxies)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        if self.metrics_enabled() {
            Some(SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }
}

/// Split a comma-separated value, dropping blanks.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            environment: Environment::Development,
            database_url: None,
            db_max_open_conns: 25,
            db_max_idle_conns: 25,
            db_max_idle_time: Duration::from_secs(15 * 60),
            db_query_timeout: Duration::from_secs(5),
            db_run_migrations: true,
            limiter: RateLimitConfig::default(),
            auth_failure_limit_per_minute: 10,
            auth_failure_burst: 5,
            trusted_proxies: vec![],
            cors_allowed_origins: vec!["*".to_string()],
            max_request_body_size: 1024 * 1024,
            bcrypt_cost: bcrypt::DEFAULT_COST,
            activation_token_ttl: Duration::from_secs(3 * 24 * 60 * 60),
            auth_token_ttl: Duration::from_secs(24 * 60 * 60),
            password_reset_token_ttl: Duration::from_secs(45 * 60),
            smtp: SmtpSettings {
                port: 25,
                sender: "Movie Catalog <no-reply@movie-catalog.local>".to_string(),
                ..SmtpSettings::default()
            },
            shutdown_grace_period: Duration::from_secs(20),
            task_drain_timeout: Duration::from_secs(20),
            health_check_interval: Duration::from_secs(30),
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.port, 4000);
        assert_eq!(config.limiter.rps, 2.0);
        assert_eq!(config.limiter.burst, 4);
        assert_eq!(config.bcrypt_cost, 12);
        assert_eq!(config.activation_token_ttl, Duration::from_secs(259_200));
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("Production".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!(" staging ".parse::<Environment>(), Ok(Environment::Staging));
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_validate_idle_exceeds_open() {
        let config = Config {
            db_max_open_conns: 5,
            db_max_idle_conns: 10,
            ..Config::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("DB_MAX_IDLE_CONNS"));
    }

    #[test]
    fn test_validate_bcrypt_cost_bounds() {
        for cost in [3, 32] {
            let config = Config {
                bcrypt_cost: cost,
                ..Config::default()
            };
            assert!(config.validate().unwrap_err().to_string().contains("BCRYPT_COST"));
        }
    }

    #[test]
    fn test_validate_limiter_settings() {
        let mut config = Config::default();
        config.limiter.burst = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));

        // Disabled limiter settings are not checked
        config.limiter.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_ttl() {
        let config = Config {
            password_reset_token_ttl: Duration::ZERO,
            ..Config::default()
        };
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("PASSWORD_RESET_TOKEN_TTL_SECS")
        );
    }

    #[test]
    fn test_production_requires_database() {
        let config = Config {
            environment: Environment::Production,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            environment: Environment::Production,
            database_url: Some(DatabaseUrl("postgres://localhost/catalog".into())),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_database_url_is_redacted() {
        let config = Config {
            database_url: Some(DatabaseUrl("postgres://user:secret@db/catalog".into())),
            ..Config::default()
        };
        assert!(!format!("{config:?}").contains("secret"));
        assert!(!format!("{:?}", config.pg_settings().unwrap()).contains("secret"));
    }

    #[test]
    fn test_pg_settings_only_with_url() {
        assert!(Config::default().pg_settings().is_none());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" 10.0.0.0/8, ,172.16.0.0/12 "),
            vec!["10.0.0.0/8".to_string(), "172.16.0.0/12".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_metrics_addr() {
        assert!(Config::default().metrics_addr().is_some());
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
    }
}
