//! Fire-and-forget work that never outlives the server.
//!
//! Every unit of work is tracked from the moment it is scheduled until it
//! finishes, so shutdown can wait for outstanding items:
//!
//! ```text
//! run(name, work)
//!    │  tracker token acquired (outstanding += 1)
//!    ▼
//! supervisor task ──spawn──▶ work task
//!    │                          │
//!    │◀──── JoinHandle ─────────┘  Ok | panic | cancelled
//!    ▼
//! outcome logged + counted, token dropped (outstanding -= 1)
//! ```
//!
//! A panic inside `work` unwinds only to its own task boundary. The
//! supervisor observes it through the `JoinError`, logs it at error level and
//! keeps the process alive.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::metrics;

/// Manager for transient background work (emails and similar side effects).
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    faulted: Arc<AtomicU64>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `work` without waiting for it.
    ///
    /// Returns `false` when the manager is already draining; the work is then
    /// dropped without running.
    pub fn run<F>(&self, name: &'static str, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            warn!(task = name, "Background task rejected, manager is draining");
            return false;
        }

        // Held by the supervisor and released on every exit path.
        let guard = self.tracker.token();
        let tracker = self.tracker.clone();
        let faulted = Arc::clone(&self.faulted);
        metrics::set_background_tasks_outstanding(tracker.len());

        let span = info_span!("background_task", task = name);
        tokio::spawn(
            async move {
                let outcome = tokio::spawn(work.in_current_span()).await;

                match outcome {
                    Ok(()) => {
                        debug!("Background task completed");
                        metrics::record_background_task(name, "completed");
                    }
                    Err(e) if e.is_panic() => {
                        faulted.fetch_add(1, Ordering::Relaxed);
                        let message = panic_message(e.into_panic());
                        error!(panic = %message, "Background task panicked");
                        metrics::record_background_task(name, "panicked");
                    }
                    Err(e) => {
                        warn!(error = %e, "Background task cancelled");
                        metrics::record_background_task(name, "cancelled");
                    }
                }

                drop(guard);
                metrics::set_background_tasks_outstanding(tracker.len());
            }
            .instrument(span),
        );

        true
    }

    /// Number of scheduled tasks that have not finished yet.
    pub fn outstanding(&self) -> usize {
        self.tracker.len()
    }

    /// Number of tasks that ended in a panic since startup.
    pub fn faulted(&self) -> u64 {
        self.faulted.load(Ordering::Relaxed)
    }

    pub fn is_draining(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Refuse new work and wait up to `timeout` for outstanding tasks.
    ///
    /// Returns `true` when every task finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();

        let outstanding = self.tracker.len();
        if outstanding > 0 {
            info!(
                outstanding,
                timeout_secs = timeout.as_secs(),
                "Waiting for background tasks to finish"
            );
        }

        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => {
                info!(faulted = self.faulted(), "All background tasks have completed");
                true
            }
            Err(_) => {
                warn!(
                    outstanding = self.tracker.len(),
                    timeout_secs = timeout.as_secs(),
                    "Background task drain timed out"
                );
                false
            }
        }
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
