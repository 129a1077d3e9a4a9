//! Health and readiness endpoints.
//!
//! # Endpoints
//!
//! - `GET /v1/healthcheck` - Liveness with environment, version and uptime
//! - `GET /ready` - Readiness probe backed by a store ping
//!
//! # Health vs Readiness
//!
//! - **Health**: Returns 200 while the process is serving, includes details
//! - **Readiness**: Returns 503 when the store is unreachable or shutdown
//!   has begun, so load balancers stop routing new traffic

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{instrument, warn};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub environment: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub system_info: SystemInfo,
    pub store: &'static str,
    pub uptime_seconds: u64,
    pub background_tasks: usize,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint.
///
/// Always returns 200 OK with status details in the body.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "available",
///   "system_info": { "environment": "development", "version": "0.1.0" },
///   "store": "memory",
///   "uptime_seconds": 3600,
///   "background_tasks": 0,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn healthcheck(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.background.is_draining() {
            "shutting_down"
        } else {
            "available"
        },
        system_info: SystemInfo {
            environment: state.config.environment.as_str(),
            version: env!("CARGO_PKG_VERSION"),
        },
        store: state.db.backend(),
        uptime_seconds: state.uptime_seconds(),
        background_tasks: state.background.outstanding(),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// ```yaml
/// readinessProbe:
///   httpGet:
///     path: /ready
///     port: 4000
/// ```
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    if state.background.is_draining() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    match state.db.ping().await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) => {
            warn!(error = %e, backend = state.db.backend(), "Readiness check failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
