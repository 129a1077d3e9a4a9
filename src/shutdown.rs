//! Server lifetime supervision.
//!
//! ```text
//! SIGINT/SIGTERM ─▶ token cancelled ─▶ listener stops accepting
//!                                        │
//!                       in-flight requests finish ≤ grace period
//!                                        │ (elapsed: remaining connections dropped)
//!                                        ▼
//!                      background tasks drain ≤ drain timeout
//! ```
//!
//! The caller then stops maintenance tasks and closes the store.

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::background::BackgroundTasks;
use crate::utils;

/// How the HTTP server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Every in-flight request completed inside the grace period.
    Graceful,
    /// The grace period elapsed and open connections were abandoned.
    ForcedClose,
}

#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace_period: Duration,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace_period: Duration, drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace_period,
            drain_timeout,
        }
    }

    /// Token cancelled once shutdown begins.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Begin shutdown without an OS signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Translate the first SIGINT/SIGTERM into [`trigger`](Self::trigger).
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = token.cancelled() => {}
                _ = utils::shutdown_signal() => token.cancel(),
            }
        })
    }

    /// Serve `app` on `listener` until shutdown is triggered.
    ///
    /// Each request carries `ConnectInfo<SocketAddr>` for client identity.
    pub async fn serve(&self, listener: TcpListener, app: Router) -> io::Result<ServeOutcome> {
        let token = self.token.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .into_future();
        let mut server = std::pin::pin!(server);

        tokio::select! {
            result = &mut server => return result.map(|()| ServeOutcome::Graceful),
            _ = self.token.cancelled() => {}
        }

        info!(
            grace_period_secs = self.grace_period.as_secs(),
            "Shutdown signal received, waiting for in-flight requests"
        );

        match tokio::time::timeout(self.grace_period, server).await {
            Ok(result) => {
                info!("HTTP server stopped gracefully");
                result.map(|()| ServeOutcome::Graceful)
            }
            Err(_) => {
                warn!(
                    grace_period_secs = self.grace_period.as_secs(),
                    "Grace period elapsed, closing remaining connections"
                );
                Ok(ServeOutcome::ForcedClose)
            }
        }
    }

    /// Wait for outstanding background work, bounded by the drain timeout.
    pub async fn drain(&self, tasks: &BackgroundTasks) -> bool {
        tasks.drain(self.drain_timeout).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::routing::get;
    use std::sync::Arc;
    use tokio::sync::Notify;

    async fn start(
        coordinator: &ShutdownCoordinator,
        delay: Duration,
    ) -> (
        SocketAddr,
        Arc<Notify>,
        JoinHandle<io::Result<ServeOutcome>>,
    ) {
        let entered = Arc::new(Notify::new());
        let notify = Arc::clone(&entered);
        let app = Router::new().route(
            "/slow",
            get(move || {
                let notify = Arc::clone(&notify);
                async move {
                    notify.notify_one();
                    tokio::time::sleep(delay).await;
                    "done"
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator = coordinator.clone();
        let handle = tokio::spawn(async move { coordinator.serve(listener, app).await });
        (addr, entered, handle)
    }

    #[tokio::test]
    async fn test_in_flight_request_completes_within_grace_period() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5), Duration::from_secs(1));
        let (addr, entered, server) = start(&coordinator, Duration::from_millis(100)).await;

        let client = tokio::spawn(async move {
            reqwest::get(format!("http://{addr}/slow")).await.unwrap()
        });
        entered.notified().await;
        coordinator.trigger();

        let response = client.await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "done");
        assert_eq!(server.await.unwrap().unwrap(), ServeOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_grace_period_elapses_into_forced_close() {
        let coordinator =
            ShutdownCoordinator::new(Duration::from_millis(100), Duration::from_secs(1));
        let (addr, entered, server) = start(&coordinator, Duration::from_secs(30)).await;

        let _client = tokio::spawn(async move { reqwest::get(format!("http://{addr}/slow")).await });
        entered.notified().await;
        coordinator.trigger();

        assert_eq!(server.await.unwrap().unwrap(), ServeOutcome::ForcedClose);
    }

    #[tokio::test]
    async fn test_idle_server_stops_immediately() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5), Duration::from_secs(1));
        let (_addr, _entered, server) = start(&coordinator, Duration::ZERO).await;

        coordinator.trigger();
        assert!(coordinator.is_triggered());
        assert_eq!(server.await.unwrap().unwrap(), ServeOutcome::Graceful);
    }

    #[tokio::test]
    async fn test_drain_uses_configured_timeout() {
        let coordinator =
            ShutdownCoordinator::new(Duration::from_secs(1), Duration::from_millis(50));
        let tasks = BackgroundTasks::new();
        tasks.run("stuck", std::future::pending::<()>());

        assert!(!coordinator.drain(&tasks).await);
    }
}
