//! The request-processing control plane.
//!
//! Every inbound request passes through these layers before any handler
//! runs:
//!
//! ```text
//! Request → Rate Limiter → Authenticate → (route) → Require Permission → Handler
//!              ↓               ↓                         ↓
//!          429 + Retry-After  401 / 429             401 / 403
//! ```
//!
//! - **Rate Limiting**: per-client token buckets with idle-entry eviction
//! - **Authentication**: bearer tokens resolved against the token store
//! - **Authorization**: per-route permission checks on the resolved identity
//! - **Client Identity**: connection peer address, forwarded headers only from
//!   trusted proxies
//!
//! A request rejected by the rate limiter never reaches the token store.

pub mod auth;
pub mod authorize;
pub mod ip;
pub mod rate_limit;

pub use auth::{AuthenticateLayer, authenticate, bearer_token};
pub use authorize::{RequirePermission, authorize};
pub use ip::{CidrRange, TrustedProxyConfig, UNKNOWN_CLIENT, client_identity};
pub use rate_limit::{RateLimitConfig, RateLimitError, RateLimitLayer, RateLimiterRegistry};
