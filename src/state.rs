//! Shared application state for Axum handlers.
//!
//! This module provides thread-safe, clonable state that is shared across
//! all request handlers. It includes:
//!
//! - **Store**: the `Database` handle (PostgreSQL or in-memory)
//! - **Limiter**: the per-client rate limiter registry
//! - **Background tasks**: fire-and-forget work such as emails
//! - **Mailer**: delivery for rendered emails
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Long-lived maintenance tasks (limiter sweep, store health check) are
//! managed with `tokio_util::task::TaskTracker` and `CancellationToken`.
//! Call `shutdown()` to stop them. Transient work goes through
//! [`BackgroundTasks`] and is drained separately.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::OnceCell;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::background::BackgroundTasks;
use crate::config::Config;
use crate::data::Password;
use crate::error::{AppError, AppResult};
use crate::mailer::{Email, Mailer, Template, TemplateData};
use crate::metrics;
use crate::middleware::RateLimiterRegistry;
use crate::store::Database;

const DUMMY_PASSWORD_PLAINTEXT: &str = "timing-parity-placeholder";

/// Shared application state for Axum handlers.
///
/// # Lifecycle
///
/// Maintenance tasks are spawned when the state is created. Call
/// `shutdown()` before dropping to ensure clean task termination:
///
/// ```rust,ignore
/// let state = AppState::new(db, config, mailer)?;
/// // ... serve ...
/// state.background.drain(config.task_drain_timeout).await;
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiterRegistry>,
    pub background: BackgroundTasks,
    pub mailer: Arc<dyn Mailer>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Hashed on first use at the configured bcrypt cost
    dummy_password: Arc<OnceCell<Password>>,
    /// Tracks maintenance tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling maintenance tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the state and start the maintenance tasks.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the limiter settings are invalid.
    pub fn new(db: Arc<dyn Database>, config: Config, mailer: Arc<dyn Mailer>) -> AppResult<Self> {
        let limiter = RateLimiterRegistry::new(config.limiter.clone())
            .map_err(|e| AppError::Config(format!("Invalid limiter settings: {e}")))?;

        let state = Self {
            db,
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            background: BackgroundTasks::new(),
            mailer,
            started_at: Instant::now(),
            dummy_password: Arc::new(OnceCell::new()),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        // Spawn maintenance tasks
        state
            .limiter
            .spawn_sweeper(&state.task_tracker, state.cancellation_token.clone());
        state.spawn_health_check_task();

        Ok(state)
    }

    /// Render `template` and deliver it on a background task.
    ///
    /// Delivery failures are logged by the task; the caller never waits.
    pub fn send_email(&self, template: Template, recipient: &str, data: TemplateData) -> bool {
        let email = Email::render(template, recipient, &data);
        let mailer = Arc::clone(&self.mailer);

        self.background.run("send_email", async move {
            match mailer.send(&email).await {
                Ok(()) => metrics::record_email(email.template.name(), "sent"),
                Err(e) => {
                    warn!(
                        error = %e,
                        template = email.template.name(),
                        "Failed to send email"
                    );
                    metrics::record_email(email.template.name(), "failed");
                }
            }
        })
    }

    /// Hash to verify against when no account matches an email.
    ///
    /// Made at `bcrypt_cost` so an unknown email costs as much as a wrong
    /// password.
    pub async fn dummy_password(&self) -> AppResult<&Password> {
        self.dummy_password
            .get_or_try_init(|| {
                Password::new(DUMMY_PASSWORD_PLAINTEXT, self.config.bcrypt_cost)
            })
            .await
    }

    /// Spawn a background store health check.
    ///
    /// Periodically pings the store and logs a warning if it is unreachable,
    /// before user requests start failing.
    fn spawn_health_check_task(&self) {
        let interval_duration = self.config.health_check_interval;
        if interval_duration.is_zero() {
            debug!("Store health check disabled");
            return;
        }

        let db = Arc::clone(&self.db);
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(interval_duration);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Health check task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        match db.ping().await {
                            Ok(()) => {
                                metrics::set_store_up(true);
                                trace!(backend = db.backend(), "Health check: store reachable");
                            }
                            Err(e) => {
                                metrics::set_store_up(false);
                                warn!(error = %e, backend = db.backend(), "Health check: store unreachable");
                            }
                        }
                    }
                }
            }

            debug!("Health check task shutting down");
        });
    }

    /// Stop the maintenance tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        info!("Stopping maintenance tasks");

        // Signal all tasks to stop
        self.cancellation_token.cancel();

        // Close the tracker - no new tasks can be spawned
        self.task_tracker.close();

        // Wait for all tasks to complete
        self.task_tracker.wait().await;

        info!("All maintenance tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
