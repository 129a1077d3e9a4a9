//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets / propagates x-request-id
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← Span per request, status + latency on response
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │   Catch Panic    │ ← Handler panics become a 500 JSON body
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Rate Limiting   │ ← 429 if exceeded, before any store access
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Authentication  │ ← 401 for a bad bearer token, else an Identity
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Body Limit      │
//! └────────┬─────────┘
//!          │
//!          ▼
//!   Require Permission (per route) → Handler
//! ```
//!
//! # Route Groups
//!
//! - `/v1/healthcheck`, `/ready` - Health & readiness (no permission)
//! - `/v1/movies` - Catalog, `movies:read` / `movies:write`
//! - `/v1/users` - Registration, activation, password reset
//! - `/v1/tokens` - Token issuance

use std::any::Any;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post, put};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{self, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, error, info};

use crate::background::panic_message;
use crate::data::Permission;
use crate::error::AppError;
use crate::handlers;
use crate::metrics;
use crate::middleware::{AuthenticateLayer, RateLimitLayer, RequirePermission};
use crate::state::AppState;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Build the application router with all routes and middleware configured.
///
/// # Middleware Configuration
///
/// - **Rate Limiting**: skipped when `LIMITER_ENABLED=false`
/// - **Authentication**: always on; requests without a bearer token continue
///   as the anonymous identity
/// - **Failed-token guard**: skipped when `AUTH_FAILURE_LIMIT_PER_MINUTE=0`
/// - **CORS**: configured from `cors_allowed_origins`
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    let read = || RequirePermission::new(Permission::MoviesRead);
    let write = || RequirePermission::new(Permission::MoviesWrite);

    // =========================================================================
    // Routes
    // =========================================================================
    let mut router = Router::new()
        .route("/v1/healthcheck", get(handlers::healthcheck))
        .route("/ready", get(handlers::readiness_check))
        // Movies
        .route("/v1/movies", get(handlers::list_movies).layer(read()))
        .route("/v1/movies", post(handlers::create_movie).layer(write()))
        .route("/v1/movies/{id}", get(handlers::show_movie).layer(read()))
        .route(
            "/v1/movies/{id}",
            patch(handlers::update_movie).layer(write()),
        )
        .route(
            "/v1/movies/{id}",
            delete(handlers::delete_movie).layer(write()),
        )
        // Users
        .route("/v1/users", post(handlers::register_user))
        .route("/v1/users/activated", put(handlers::activate_user))
        .route("/v1/users/password", put(handlers::update_user_password))
        // Tokens
        .route(
            "/v1/tokens/authentication",
            post(handlers::create_authentication_token),
        )
        .route(
            "/v1/tokens/activation",
            post(handlers::create_activation_token),
        )
        .route(
            "/v1/tokens/password-reset",
            post(handlers::create_password_reset_token),
        )
        .fallback(handlers::not_found)
        .method_not_allowed_fallback(handlers::method_not_allowed);

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Request body size limit
    info!(
        max_size_kb = config.max_request_body_size / 1024,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Authentication
    let trusted = config.trusted_proxy_config();
    let auth = AuthenticateLayer::new(state.db.clone(), trusted.clone()).with_failure_limit(
        config.auth_failure_limit_per_minute,
        config.auth_failure_burst,
    );
    if auth.failure_protection_enabled() {
        info!(
            per_minute = config.auth_failure_limit_per_minute,
            burst = config.auth_failure_burst,
            "Failed-token lockout enabled"
        );
    } else {
        info!("Failed-token lockout disabled (AUTH_FAILURE_LIMIT_PER_MINUTE=0)");
    }
    router = router.layer(auth);

    // 3. Rate limiting - runs before authentication in the request pipeline
    if state.limiter.is_enabled() {
        info!(
            rps = config.limiter.rps,
            burst = config.limiter.burst,
            trusted_proxies = config.trusted_proxies.len(),
            "Rate limiting enabled"
        );
        router = router.layer(RateLimitLayer::new(state.limiter.clone(), trusted));
    } else {
        info!("Rate limiting disabled (LIMITER_ENABLED=false)");
    }

    // 4. CORS
    router = router.layer(build_cors_layer(&config.cors_allowed_origins));

    // 5. Panics inside the stack become a 500 JSON response
    router = router.layer(CatchPanicLayer::custom(handle_panic));

    // 6. Request ID, then tracing (request id is set before the span opens)
    router = router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &Request<Body>| {
                        let request_id = req
                            .headers()
                            .get(REQUEST_ID_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default();
                        tracing::info_span!(
                            "http_request",
                            method = %req.method(),
                            path = %req.uri().path(),
                            request_id = %request_id,
                        )
                    })
                    .on_response(|res: &Response<Body>, latency: Duration, _span: &Span| {
                        let status = res.status().as_u16();
                        metrics::record_request_duration(status, latency.as_secs_f64());
                        info!(
                            status,
                            latency_ms = latency.as_millis() as u64,
                            "Request completed"
                        );
                    }),
            ),
    );

    router.with_state(state)
}

fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response<Body> {
    error!(panic = %panic_message(payload), "Request handler panicked");
    AppError::Internal("handler panicked".to_string()).into_response()
}

/// Build CORS layer from configuration.
///
/// `*` allows any origin. Convenient for development; production should list
/// explicit origins.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    let layer = if allow_any {
        CorsLayer::new().allow_origin(cors::Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    layer.allow_methods(cors::Any).allow_headers(cors::Any)
}
