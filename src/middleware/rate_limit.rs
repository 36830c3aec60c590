//! Per-client fixed-window rate limiting.
//!
//! # Algorithm
//!
//! Each client key (see [`client_ip`]) owns a bucket `{count, reset_at}`. The
//! first request after `reset_at` starts a new window with `count = 0`. Every
//! request increments `count`, and the request is allowed while
//! `count <= max_requests`. The read-increment-compare runs under the
//! DashMap shard lock for that key, so concurrent requests never undercount.
//!
//! Expired buckets are swept opportunistically on roughly one request in
//! ten instead of by a background task.
//!
//! # Response Headers
//!
//! Every response passing through the layer carries:
//! - `X-RateLimit-Limit`: configured `max_requests`
//! - `X-RateLimit-Remaining`: requests left in the window
//! - `X-RateLimit-Reset`: window end, in Unix seconds
//!
//! Rejected requests (429) also carry `Retry-After` in seconds.
//!
//! # Scaling
//!
//! Buckets live in process memory. Several instances behind a load balancer
//! each enforce their own limit, and a restart forgets all windows.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request, Response, header};
use axum::response::IntoResponse;
use dashmap::DashMap;
use tower::{Layer, Service};
use tracing::warn;

use super::ip::client_ip;
use crate::config::RateLimitProfile;
use crate::error::ApiError;
use crate::metrics;

pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Chance that a request triggers a sweep of expired buckets.
const CLEANUP_PROBABILITY: f64 = 0.1;

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time left in the current window.
    pub reset_after: Duration,
}

impl RateDecision {
    /// Whole seconds until the window resets, at least 1.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.reset_after.as_secs();
        let rounded = if self.reset_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }

    /// Window end as Unix seconds.
    pub fn reset_epoch_secs(&self) -> u64 {
        (SystemTime::now() + self.reset_after)
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Write the `X-RateLimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(RATE_LIMIT_RESET, HeaderValue::from(self.reset_epoch_secs()));
    }
}

/// A rate limiter keyed by client identifier.
///
/// Implementations decide; they never fail.
pub trait RateLimiter: Send + Sync {
    fn check_limit(&self, client: &str) -> RateDecision;
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: Instant,
}

/// In-memory fixed-window limiter.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    name: &'static str,
    profile: RateLimitProfile,
    buckets: DashMap<String, Bucket>,
}

impl FixedWindowLimiter {
    /// `name` labels log lines and metrics (`api`, `custom_query`).
    pub fn new(name: &'static str, profile: RateLimitProfile) -> Self {
        Self {
            name,
            profile,
            buckets: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn profile(&self) -> RateLimitProfile {
        self.profile
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets whose window has ended.
    pub fn cleanup(&self, now: Instant) {
        self.buckets.retain(|_, bucket| bucket.reset_at > now);
        metrics::set_rate_limit_buckets(self.name, self.buckets.len());
    }

    /// Check `client` as of `now`.
    pub fn check_at(&self, client: &str, now: Instant) -> RateDecision {
        let max = self.profile.max_requests;
        let window = self.profile.window;

        let mut bucket = self
            .buckets
            .entry(client.to_string())
            .or_insert_with(|| Bucket {
                count: 0,
                reset_at: now + window,
            });
        if now >= bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + window;
        }
        bucket.count = bucket.count.saturating_add(1);

        RateDecision {
            allowed: bucket.count <= max,
            limit: max,
            remaining: max.saturating_sub(bucket.count),
            reset_after: bucket.reset_at.saturating_duration_since(now),
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check_limit(&self, client: &str) -> RateDecision {
        let now = Instant::now();
        if rand::random::<f64>() < CLEANUP_PROBABILITY {
            self.cleanup(now);
        }
        self.check_at(client, now)
    }
}

/// Tower layer enforcing a [`RateLimiter`] per client IP.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<dyn RateLimiter>,
    profile: &'static str,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<dyn RateLimiter>, profile: &'static str) -> Self {
        Self { limiter, profile }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            profile: self.profile,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<dyn RateLimiter>,
    profile: &'static str,
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
        let client = client_ip(req.headers());
        let decision = self.limiter.check_limit(&client);
        let profile = self.profile;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if !decision.allowed {
                let retry_after = decision.retry_after_secs();
                warn!(
                    client_ip = %client,
                    path = %req.uri().path(),
                    profile,
                    retry_after_secs = retry_after,
                    "Rate limit exceeded"
                );
                metrics::record_rate_limit_rejection(profile);

                let mut response = ApiError::rate_limited(retry_after).into_response();
                decision.apply_headers(response.headers_mut());
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                return Ok(response);
            }

            let mut response = inner.call(req).await?;
            decision.apply_headers(response.headers_mut());
            Ok(response)
        })
    }
}
