use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use movie_catalog::config::Environment;
use movie_catalog::mailer::LogMailer;
use movie_catalog::store::{Database, MemoryDatabase, PgDatabase};
use movie_catalog::{AppState, Config, ServeOutcome, ShutdownCoordinator, build_router, metrics};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    info!(
        "Starting Movie Catalog v{}",
        env!("CARGO_PKG_VERSION")
    );

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// JSON logs in production, human-readable otherwise.
///
/// Reads `APP_ENV` directly since logging starts before configuration loads.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let production = std::env::var("APP_ENV")
        .ok()
        .and_then(|v| v.parse::<Environment>().ok())
        .is_some_and(Environment::is_production);

    if production {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }
}

/// Run the application, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        environment = %config.environment,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr() {
        metrics::try_init_metrics(addr);
    } else {
        info!("Metrics disabled (METRICS_PORT=0)");
    }

    // Select the store
    let db: Arc<dyn Database> = match config.pg_settings() {
        Some(settings) => {
            info!("Connecting to PostgreSQL...");
            let pg = PgDatabase::connect(&settings).await.map_err(|e| {
                error!("Failed to connect to PostgreSQL: {e}");
                exitcode::UNAVAILABLE
            })?;
            if config.db_run_migrations {
                pg.migrate().await.map_err(|e| {
                    error!("Failed to apply migrations: {e}");
                    exitcode::UNAVAILABLE
                })?;
            }
            Arc::new(pg)
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store; data is lost on exit");
            Arc::new(MemoryDatabase::with_timeout(config.db_query_timeout))
        }
    };

    // Build application state and router
    let mailer = Arc::new(LogMailer::new(config.smtp.clone()));
    let coordinator =
        ShutdownCoordinator::new(config.shutdown_grace_period, config.task_drain_timeout);
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid server address: {e}");
        exitcode::CONFIG
    })?;

    let state = AppState::new(db.clone(), config, mailer).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    // Start server
    coordinator.listen_for_signals();
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Server listening on http://{addr}");
    info!("API endpoints:");
    info!("  GET    /v1/healthcheck             - Health check");
    info!("  GET    /ready                      - Readiness check");
    info!("  GET    /v1/movies                  - List movies");
    info!("  POST   /v1/movies                  - Create movie");
    info!("  GET    /v1/movies/{{id}}             - Show movie");
    info!("  PATCH  /v1/movies/{{id}}             - Update movie");
    info!("  DELETE /v1/movies/{{id}}             - Delete movie");
    info!("  POST   /v1/users                   - Register user");
    info!("  PUT    /v1/users/activated         - Activate user");
    info!("  PUT    /v1/users/password          - Reset password");
    info!("  POST   /v1/tokens/authentication   - Issue authentication token");
    info!("  POST   /v1/tokens/activation       - Re-send activation token");
    info!("  POST   /v1/tokens/password-reset   - Send password reset token");

    let outcome = coordinator.serve(listener, app).await.map_err(|e| {
        error!("Server error: {e}");
        exitcode::SOFTWARE
    })?;
    if outcome == ServeOutcome::ForcedClose {
        warn!("Some connections were closed before their requests completed");
    }

    // Drain background work, then stop maintenance tasks
    info!(
        outstanding = state.background.outstanding(),
        "HTTP server stopped, draining background tasks..."
    );
    if !coordinator.drain(&state.background).await {
        warn!(
            outstanding = state.background.outstanding(),
            "Background tasks still running after the drain timeout"
        );
    }
    state.shutdown().await;
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}
