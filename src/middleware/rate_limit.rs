//! Rate limiting pre-filter.
//!
//! Per-client token bucket keyed by the socket peer IP. The bucket refills at
//! the configured per-minute rate; whitelisted addresses bypass the check.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::ApiError;

#[derive(Clone)]
pub struct RateLimitConfig {
    /// Sustained requests per minute; also the bucket capacity.
    pub per_minute: u32,
    /// Peer addresses exempt from the bucket.
    pub whitelist: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: 60,
            whitelist: Vec::new(),
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<IpAddr, Bucket>>>,
}

pub enum RateLimitResult {
    Allowed,
    Exceeded { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn check(&self, ip: IpAddr) -> RateLimitResult {
        self.check_at(ip, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, now: Instant) -> RateLimitResult {
        if self.config.whitelist.iter().any(|w| w == &ip.to_string()) {
            return RateLimitResult::Allowed;
        }

        let capacity = self.config.per_minute.max(1) as f64;
        let rate_per_sec = capacity / 60.0;

        let mut state = self.state.lock();
        let bucket = state.entry(ip).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitResult::Allowed
        } else {
            let deficit = 1.0 - bucket.tokens;
            RateLimitResult::Exceeded {
                retry_after: Duration::from_secs_f64((deficit / rate_per_sec).ceil()),
            }
        }
    }

    /// Periodic cleanup of stale buckets (call from a background task).
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.retain(|_, bucket| now.duration_since(bucket.last_refill) < Duration::from_secs(600));
    }
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    match limiter.check(addr.ip()) {
        RateLimitResult::Allowed => Ok(next.run(request).await),
        RateLimitResult::Exceeded { retry_after } => {
            warn!(
                ip = %addr.ip(),
                retry_after_secs = retry_after.as_secs(),
                "rate limit exceeded"
            );
            Err(ApiError::RateLimited {
                retry_after_secs: retry_after.as_secs(),
            })
        }
    }
}
