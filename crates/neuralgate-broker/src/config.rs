//! Broker configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Default listen address
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8787";

/// Fixed ceiling for one passthrough round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Largest accepted passthrough request body
pub const DEFAULT_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Per-IP fixed window applied to public HTTP ingress
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    /// Sweep expired windows every N checks
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
            cleanup_interval: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub listen: SocketAddr,

    /// Take the caller IP from the leftmost `X-Forwarded-For` entry
    pub trust_proxy: bool,

    pub request_timeout: Duration,

    /// Bound on each datastore round trip made on the auth path
    pub lookup_timeout: Duration,

    pub body_limit: usize,

    pub rate_limit: RateLimitConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8787)),
            trust_proxy: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lookup_timeout: Duration::from_secs(10),
            body_limit: DEFAULT_BODY_LIMIT,
            rate_limit: RateLimitConfig::default(),
        }
    }
}
