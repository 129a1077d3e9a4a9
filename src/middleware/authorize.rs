//! Permission checks for individual routes.
//!
//! [`authorize`] is pure: it reads the [`Identity`] the authenticator attached
//! and never touches the store. [`RequirePermission`] applies it as a layer on
//! a single method router:
//!
//! ```rust,ignore
//! Router::new()
//!     .route("/v1/movies", get(list_movies).layer(RequirePermission::new(Permission::MoviesRead)))
//!     .route("/v1/movies", post(create_movie).layer(RequirePermission::new(Permission::MoviesWrite)))
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::debug;

use crate::data::{Identity, Permission};
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Check `identity` against `required`.
///
/// Anonymous callers must authenticate, inactive accounts are refused and
/// activated users need the permission itself.
pub fn authorize(identity: &Identity, required: Permission) -> AppResult<()> {
    match identity {
        Identity::Anonymous => Err(AppError::AuthenticationRequired),
        Identity::User { user, .. } if !user.activated => Err(AppError::InactiveAccount),
        Identity::User { permissions, .. } if !permissions.includes(required) => {
            Err(AppError::PermissionDenied(required))
        }
        Identity::User { .. } => Ok(()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequirePermission {
    permission: Permission,
}

impl RequirePermission {
    pub fn new(permission: Permission) -> Self {
        Self { permission }
    }
}

impl<S> Layer<S> for RequirePermission {
    type Service = RequirePermissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequirePermissionService {
            inner,
            permission: self.permission,
        }
    }
}

#[derive(Clone)]
pub struct RequirePermissionService<S> {
    inner: S,
    permission: Permission,
}

impl<S> Service<Request<Body>> for RequirePermissionService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // No identity means the authenticator did not run: treat as anonymous.
        let verdict = match req.extensions().get::<Identity>() {
            Some(identity) => authorize(identity, self.permission),
            None => authorize(&Identity::Anonymous, self.permission),
        };

        match verdict {
            Ok(()) => {
                let mut inner = self.inner.clone();
                Box::pin(async move { inner.call(req).await })
            }
            Err(err) => {
                debug!(
                    path = %req.uri().path(),
                    permission = %self.permission,
                    reason = err.code(),
                    "Authorization denied"
                );
                metrics::record_authz_denial(err.code());
                Box::pin(async move { Ok(err.into_response()) })
            }
        }
    }
}
