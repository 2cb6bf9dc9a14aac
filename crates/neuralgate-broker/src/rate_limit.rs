//! Per-IP fixed window rate limiting for public HTTP ingress
//!
//! Applied to the passthrough and report routes only; the agent socket is
//! never limited. Responses carry `RateLimit-Limit`, `RateLimit-Remaining`
//! and `RateLimit-Reset` headers, and rejections add `Retry-After`.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::GatewayError;
use crate::ingress::source_ip;

const LIMIT_HEADER: HeaderName = HeaderName::from_static("ratelimit-limit");
const REMAINING_HEADER: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RESET_HEADER: HeaderName = HeaderName::from_static("ratelimit-reset");

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the caller's window resets
    pub reset_secs: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Count one request from `key` and decide whether it may proceed
    pub fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();

        let count = self.checks.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval.max(1) == 0 {
            self.purge_expired();
        }

        let mut window = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(window.started) >= self.config.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        let allowed = window.count < self.config.max_requests;
        if allowed {
            window.count += 1;
        }

        let reset = self
            .config
            .window
            .saturating_sub(now.duration_since(window.started));

        RateDecision {
            allowed,
            limit: self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(window.count),
            reset_secs: reset.as_secs_f64().ceil() as u64,
        }
    }

    /// Drop windows that have fully elapsed
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let window = self.config.window;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.duration_since(w.started) < window);
        debug!(
            removed = before.saturating_sub(self.windows.len()),
            "Purged expired rate limit windows"
        );
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub trust_proxy: bool,
}

/// axum middleware enforcing the limiter for the caller's source IP
pub async fn enforce(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let key = source_ip(&request, state.trust_proxy)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let decision = state.limiter.check(&key);
    if !decision.allowed {
        warn!(ip = %key, "Rate limit exceeded");
        let mut response = GatewayError::RateLimited {
            retry_after_secs: decision.reset_secs,
        }
        .into_response();
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    headers.insert(RESET_HEADER, HeaderValue::from(decision.reset_secs));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests,
            cleanup_interval: 1000,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_allows_up_to_limit_then_rejects() {
        let limiter = limiter(3);

        for remaining in [2, 1, 0] {
            let decision = limiter.check("1.2.3.4");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, remaining);
        }

        let decision = limiter.check("1.2.3.4");
        assert!(!decision.allowed);
        assert_eq!(decision.reset_secs, 60);

        assert!(limiter.check("5.6.7.8").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets() {
        let limiter = limiter(1);
        assert!(limiter.check("1.2.3.4").allowed);
        assert!(!limiter.check("1.2.3.4").allowed);

        tokio::time::advance(Duration::from_secs(30)).await;
        let decision = limiter.check("1.2.3.4");
        assert!(!decision.allowed);
        assert_eq!(decision.reset_secs, 30);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check("1.2.3.4").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = limiter(10);
        limiter.check("1.2.3.4");
        limiter.check("5.6.7.8");
        assert_eq!(limiter.tracked(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        limiter.check("9.9.9.9");
        limiter.purge_expired();
        assert_eq!(limiter.tracked(), 1);
    }
}
