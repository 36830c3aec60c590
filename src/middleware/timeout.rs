//! Client-specified data-store timeouts.
//!
//! Clients may narrow the time a query is allowed to take by sending
//! `X-Request-Timeout` in milliseconds. The configured query timeout stays
//! the upper bound:
//!
//! ```text
//! X-Request-Timeout: 5000
//! ```
//!
//! Values outside [`MIN_REQUEST_TIMEOUT_MS`]..=[`MAX_REQUEST_TIMEOUT_MS`],
//! or that do not parse, are ignored and the configured default applies.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use tracing::debug;

/// Minimum allowed request timeout (100ms).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 100;

/// Maximum allowed request timeout (5 minutes).
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 300_000;

pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout";

/// Timeout requested by the client, if valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientTimeout(pub Option<Duration>);

impl ClientTimeout {
    /// `None` if `ms` is outside the allowed range.
    pub fn from_millis(ms: u64) -> Option<Duration> {
        (MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS)
            .contains(&ms)
            .then(|| Duration::from_millis(ms))
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let Some(raw) = headers
            .get(REQUEST_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return Self(None);
        };

        let Ok(ms) = raw.trim().parse::<u64>() else {
            debug!(value = raw, "Invalid X-Request-Timeout header value, ignoring");
            return Self(None);
        };

        match Self::from_millis(ms) {
            Some(duration) => {
                debug!(timeout_ms = ms, "Client specified request timeout via header");
                Self(Some(duration))
            }
            None => {
                debug!(
                    timeout_ms = ms,
                    min = MIN_REQUEST_TIMEOUT_MS,
                    max = MAX_REQUEST_TIMEOUT_MS,
                    "Client timeout outside allowed range, ignoring"
                );
                Self(None)
            }
        }
    }

    /// The client's timeout, capped at `configured`.
    pub fn effective(&self, configured: Duration) -> Duration {
        self.0.map_or(configured, |requested| requested.min(configured))
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ClientTimeout {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &'static str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(REQUEST_TIMEOUT_HEADER, HeaderValue::from_static(value));
        map
    }

    #[test]
    fn test_bounds() {
        assert_eq!(
            ClientTimeout::from_millis(MIN_REQUEST_TIMEOUT_MS),
            Some(Duration::from_millis(100))
        );
        assert!(ClientTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS).is_some());
        assert!(ClientTimeout::from_millis(99).is_none());
        assert!(ClientTimeout::from_millis(MAX_REQUEST_TIMEOUT_MS + 1).is_none());
        assert!(ClientTimeout::from_millis(0).is_none());
    }

    #[test]
    fn test_header_parsing() {
        assert_eq!(
            ClientTimeout::from_headers(&headers(" 5000 ")),
            ClientTimeout(Some(Duration::from_secs(5)))
        );
        assert_eq!(ClientTimeout::from_headers(&headers("fast")), ClientTimeout(None));
        assert_eq!(ClientTimeout::from_headers(&headers("-5")), ClientTimeout(None));
        assert_eq!(ClientTimeout::from_headers(&HeaderMap::new()), ClientTimeout(None));
    }

    #[test]
    fn test_effective_falls_back_to_configured() {
        let configured = Duration::from_secs(30);
        assert_eq!(ClientTimeout(None).effective(configured), configured);
        assert_eq!(
            ClientTimeout(Some(Duration::from_secs(1))).effective(configured),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_effective_never_exceeds_configured() {
        let configured = Duration::from_secs(30);
        let requested = ClientTimeout::from_headers(&headers("300000"));
        assert_eq!(requested.0, Some(Duration::from_secs(300)));
        assert_eq!(requested.effective(configured), configured);
    }
}
