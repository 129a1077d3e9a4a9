//! Client identity for per-client rate limiting and brute-force protection.
//!
//! The identity is the connection's peer address taken from axum's
//! `ConnectInfo<SocketAddr>` extension. Forwarding headers are only honoured
//! when the peer itself is a configured trusted proxy:
//!
//! ```text
//! peer in TRUSTED_PROXIES?  ── yes ──▶ X-Forwarded-For (first hop) │ X-Real-IP │ peer
//!          │
//!          no ──▶ peer address
//!
//! no ConnectInfo (oneshot tests, unix sockets) ──▶ forwarded headers │ "unknown"
//! ```
//!
//! A client reaching the service directly therefore cannot pick its own
//! rate-limit key by sending `X-Forwarded-For`.
//!
//! # The "unknown" Fallback
//!
//! Requests with neither a peer address nor forwarding headers share the
//! [`UNKNOWN_CLIENT`] key and are limited collectively.

use std::borrow::Cow;
use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use axum::http::Request;
use tracing::{debug, warn};

/// Identity shared by all requests whose origin cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

// =============================================================================
// Trusted Proxy CIDR Matching
// =============================================================================

/// Parsed CIDR network range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CidrRange {
    network: IpAddr,
    prefix_len: u8,
}

impl CidrRange {
    /// Parse `"10.0.0.0/8"`, `"::1/128"` or a bare address (full-length prefix).
    pub fn parse(cidr: &str) -> Option<Self> {
        let cidr = cidr.trim();

        let (ip, prefix_len) = match cidr.split_once('/') {
            Some((ip, prefix)) => (ip.parse::<IpAddr>().ok()?, Some(prefix.parse::<u8>().ok()?)),
            None => (cidr.parse::<IpAddr>().ok()?, None),
        };

        let max_prefix = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix_len = prefix_len.unwrap_or(max_prefix);

        if prefix_len > max_prefix {
            return None;
        }

        Some(Self {
            network: ip,
            prefix_len,
        })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (&self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix_len)
                };
                (u32::from(*net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix_len)
                };
                (u128::from(*net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

/// Reverse proxies whose forwarding headers are believed.
#[derive(Debug, Clone, Default)]
pub struct TrustedProxyConfig {
    ranges: Vec<CidrRange>,
}

impl TrustedProxyConfig {
    /// Invalid CIDR strings are logged and skipped.
    pub fn new(cidrs: &[String]) -> Self {
        let ranges: Vec<CidrRange> = cidrs
            .iter()
            .filter_map(|cidr| {
                let parsed = CidrRange::parse(cidr);
                if parsed.is_none() {
                    warn!(cidr = %cidr, "Invalid CIDR range in TRUSTED_PROXIES, skipping");
                }
                parsed
            })
            .collect();

        if !ranges.is_empty() {
            debug!(count = ranges.len(), "Trusted proxy ranges configured");
        }

        Self { ranges }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ranges.is_empty()
    }

    /// Whether `ip` falls in a configured range. Nothing is trusted when no
    /// ranges are configured.
    pub fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.ranges.iter().any(|range| range.contains(ip))
    }
}

// =============================================================================
// Identity Extraction
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Forwarded<'a> {
    Xff(&'a str),
    RealIp(&'a str),
    None,
}

fn forwarded_from_headers<B>(req: &Request<B>) -> Forwarded<'_> {
    // "client, proxy1, proxy2": the first entry is the originating client
    if let Some(value) = req.headers().get("x-forwarded-for")
        && let Ok(value) = value.to_str()
        && let Some(first) = value.split(',').next()
        && !first.trim().is_empty()
    {
        return Forwarded::Xff(first.trim());
    }

    if let Some(value) = req.headers().get("x-real-ip")
        && let Ok(value) = value.to_str()
        && !value.trim().is_empty()
    {
        return Forwarded::RealIp(value.trim());
    }

    Forwarded::None
}

/// Peer address recorded by `into_make_service_with_connect_info`.
pub fn peer_addr<B>(req: &Request<B>) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Rate-limit key for the client behind `req`.
pub fn client_identity<B>(req: &Request<B>, trusted: &TrustedProxyConfig) -> Cow<'static, str> {
    let peer = peer_addr(req);

    let honour_headers = match peer {
        Some(addr) => trusted.is_trusted(&addr.ip()),
        None => true,
    };

    if honour_headers {
        match forwarded_from_headers(req) {
            Forwarded::Xff(ip) | Forwarded::RealIp(ip) => return Cow::Owned(ip.to_string()),
            Forwarded::None => {}
        }
    } else if trusted.is_enabled() && forwarded_from_headers(req) != Forwarded::None {
        debug!(
            peer = ?peer,
            "Ignoring forwarding headers from untrusted peer"
        );
    }

    match peer {
        Some(addr) => Cow::Owned(addr.ip().to_canonical().to_string()),
        None => Cow::Borrowed(UNKNOWN_CLIENT),
    }
}
