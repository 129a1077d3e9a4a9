//! Per-client rate limiting.
//!
//! # Algorithm
//!
//! Each client identity owns a direct `governor` limiter (GCRA) with a quota
//! of one cell every `1 / rps` seconds and a burst of `burst` cells. A
//! rejected request gets a `Retry-After` computed from the limiter's
//! `NotUntil`, rounded up to whole seconds.
//!
//! # Client State
//!
//! Limiters live in a [`RateLimiterRegistry`] keyed by client identity, each
//! with the time the client was last seen. The map sits behind a single
//! mutex, so the periodic sweep that evicts idle clients never races an
//! admission. The sweep runs on the application's `TaskTracker` and stops
//! when the shutdown token fires. An evicted client starts over with a full
//! burst.
//!
//! # Configuration
//!
//! - `LIMITER_RPS`: sustained requests per second per client
//! - `LIMITER_BURST`: bucket capacity
//! - `LIMITER_ENABLED`: when false no state is kept and every request passes
//! - `LIMITER_SWEEP_INTERVAL_SECS` / `LIMITER_STALE_AFTER_SECS`: eviction
//!
//! # Response Headers
//!
//! On rate limit exceeded (429):
//! - `Retry-After`: Seconds until the next request will be accepted
//! - `X-RateLimit-Limit`: Configured burst capacity
//! - `X-RateLimit-Remaining`: Always `0`

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use axum::response::IntoResponse;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use super::ip::{TrustedProxyConfig, client_identity};
use crate::error::AppError;
use crate::metrics;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(180);

/// Error type for limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimitError {
    /// RPS must be a positive finite number with a representable period.
    InvalidRps(f64),
    /// A bucket must hold at least one token.
    ZeroBurst,
    /// The sweep needs a non-zero period.
    ZeroSweepInterval,
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitError::InvalidRps(rps) => write!(
                f,
                "RPS must be a positive number (got {rps}); disable the limiter instead"
            ),
            RateLimitError::ZeroBurst => write!(f, "burst must be at least 1"),
            RateLimitError::ZeroSweepInterval => {
                write!(f, "sweep interval must be greater than zero")
            }
        }
    }
}

impl std::error::Error for RateLimitError {}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub rps: f64,
    pub burst: u32,
    pub enabled: bool,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rps: 2.0,
            burst: 4,
            enabled: true,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if !self.enabled {
            return Ok(());
        }
        self.quota()?;
        if self.sweep_interval.is_zero() {
            return Err(RateLimitError::ZeroSweepInterval);
        }
        Ok(())
    }

    /// One cell every `1 / rps` seconds, `burst` cells at once.
    pub fn quota(&self) -> Result<Quota, RateLimitError> {
        if !(self.rps.is_finite() && self.rps > 0.0) {
            return Err(RateLimitError::InvalidRps(self.rps));
        }
        let burst = NonZeroU32::new(self.burst).ok_or(RateLimitError::ZeroBurst)?;
        let quota = Duration::try_from_secs_f64(1.0 / self.rps)
            .ok()
            .and_then(Quota::with_period)
            .ok_or(RateLimitError::InvalidRps(self.rps))?;
        Ok(quota.allow_burst(burst))
    }
}

// =============================================================================
// Registry
// =============================================================================

type ClientLimiter<C> =
    RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

struct LimiterEntry<C: Clock> {
    limiter: ClientLimiter<C>,
    last_seen: Instant,
}

struct Clients<C: Clock> {
    quota: Quota,
    entries: Mutex<HashMap<String, LimiterEntry<C>>>,
}

/// Client identity → limiter.
///
/// Construct one per server and share it through `Arc`. Disabled registries
/// keep no map at all. The clock is only swapped out in tests.
pub struct RateLimiterRegistry<C: Clock = DefaultClock> {
    config: RateLimitConfig,
    clock: C,
    clients: Option<Clients<C>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        Self::with_clock(config, DefaultClock::default())
    }

    /// A registry that admits everything.
    pub fn disabled() -> Self {
        Self {
            config: RateLimitConfig {
                enabled: false,
                ..RateLimitConfig::default()
            },
            clock: DefaultClock::default(),
            clients: None,
        }
    }
}

impl<C: Clock + Clone> RateLimiterRegistry<C> {
    pub fn with_clock(config: RateLimitConfig, clock: C) -> Result<Self, RateLimitError> {
        config.validate()?;

        let clients = if config.enabled {
            Some(Clients {
                quota: config.quota()?,
                entries: Mutex::new(HashMap::new()),
            })
        } else {
            None
        };
        Ok(Self {
            config,
            clock,
            clients,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.clients.is_some()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one request from `identity`.
    pub fn allow(&self, identity: &str) -> bool {
        self.try_acquire(identity).is_ok()
    }

    /// Like [`allow`](Self::allow), returning the wait on rejection.
    pub fn try_acquire(&self, identity: &str) -> Result<(), Duration> {
        let Some(clients) = &self.clients else {
            return Ok(());
        };

        let now = Instant::now();
        let mut entries = clients.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(identity.to_string())
            .or_insert_with(|| LimiterEntry {
                limiter: RateLimiter::direct_with_clock(clients.quota, self.clock.clone()),
                last_seen: now,
            });
        entry.last_seen = now;

        entry
            .limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Evict clients idle for longer than `stale_after`. Returns the count.
    pub fn sweep(&self) -> usize {
        let Some(clients) = &self.clients else {
            return 0;
        };

        let now = Instant::now();
        let stale_after = self.config.stale_after;
        let mut entries = clients.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= stale_after);
        let evicted = before - entries.len();

        metrics::set_limiter_clients(entries.len());
        evicted
    }

    /// Number of identities currently holding a limiter.
    pub fn tracked_clients(&self) -> usize {
        self.clients.as_ref().map_or(0, |clients| {
            clients
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        })
    }
}

impl<C> RateLimiterRegistry<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Run the idle-client sweep every `sweep_interval` until `cancel` fires.
    ///
    /// Does nothing for a disabled registry.
    pub fn spawn_sweeper(self: &Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        if !self.is_enabled() {
            return;
        }

        let registry = Arc::clone(self);
        let period = self.config.sweep_interval;

        tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing is stale yet.
            ticker.tick().await;

            info!(interval_secs = period.as_secs(), "Limiter sweeper started");

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Limiter sweeper received shutdown signal");
                        break;
                    }

                    _ = ticker.tick() => {
                        let evicted = registry.sweep();
                        if evicted > 0 {
                            metrics::record_limiter_evictions(evicted);
                            debug!(evicted, remaining = registry.tracked_clients(), "Evicted idle rate-limit clients");
                        }
                    }
                }
            }

            info!("Limiter sweeper stopped");
        });
    }
}

impl<C: Clock + Clone> fmt::Debug for RateLimiterRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("config", &self.config)
            .field("tracked_clients", &self.tracked_clients())
            .finish()
    }
}

// =============================================================================
// Tower Layer
// =============================================================================

/// Rate limiting layer for the Tower middleware stack.
///
/// ```rust,ignore
/// let registry = Arc::new(RateLimiterRegistry::new(RateLimitConfig::default())?);
/// let app = Router::new()
///     .route("/v1/movies", get(list_movies))
///     .layer(RateLimitLayer::new(registry, TrustedProxyConfig::default()));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    registry: Arc<RateLimiterRegistry>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl RateLimitLayer {
    pub fn new(registry: Arc<RateLimiterRegistry>, trusted_proxies: TrustedProxyConfig) -> Self {
        Self {
            registry,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            registry: self.registry.clone(),
            trusted_proxies: self.trusted_proxies.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    registry: Arc<RateLimiterRegistry>,
    trusted_proxies: Arc<TrustedProxyConfig>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let registry = self.registry.clone();
        let mut inner = self.inner.clone();
        let identity = client_identity(&req, &self.trusted_proxies).into_owned();

        Box::pin(async move {
            match registry.try_acquire(&identity) {
                Ok(()) => inner.call(req).await,
                Err(wait) => {
                    let retry_after = wait.as_secs_f64().ceil().max(1.0) as u64;

                    warn!(
                        client = %identity,
                        path = %req.uri().path(),
                        retry_after_secs = retry_after,
                        "Rate limit exceeded"
                    );
                    metrics::record_rate_limited();

                    let mut response = AppError::RateLimitExceeded {
                        retry_after_secs: retry_after,
                    }
                    .into_response();

                    let headers = response.headers_mut();
                    headers.insert(
                        "x-ratelimit-limit",
                        HeaderValue::from(registry.config().burst),
                    );
                    headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));

                    Ok(response)
                }
            }
        })
    }
}
