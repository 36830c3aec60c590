//! Client IP extraction shared by the rate limiter and the request logger.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **These functions trust client-provided headers.** A client can set
//! `X-Forwarded-For` itself unless the service sits behind a reverse proxy
//! that overwrites it:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! Without that, a client can rotate spoofed addresses and escape per-client
//! rate limits.
//!
//! ## The "unknown" Fallback
//!
//! Requests without usable headers all share the [`UNKNOWN_IP`] key and so
//! share one rate limit bucket.

use std::borrow::Cow;

use axum::http::HeaderMap;

/// Fallback when no client IP can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// First non-empty entry of a header value list.
fn first_entry(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|entry| !entry.is_empty())
        .map(str::to_string)
}

/// Client IP from `X-Forwarded-For` (first entry), then `X-Real-IP`, else [`UNKNOWN_IP`].
///
/// Returns `Cow::Borrowed` for the fallback so the common "no proxy" path
/// does not allocate.
#[inline]
pub fn client_ip(headers: &HeaderMap) -> Cow<'static, str> {
    first_entry(headers, "x-forwarded-for")
        .or_else(|| first_entry(headers, "x-real-ip"))
        .map(Cow::Owned)
        .unwrap_or(Cow::Borrowed(UNKNOWN_IP))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let h = headers(&[("x-forwarded-for", "192.168.1.1, 10.0.0.1")]);
        assert_eq!(client_ip(&h), "192.168.1.1");
    }

    #[test]
    fn test_forwarded_for_priority_over_real_ip() {
        let h = headers(&[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "192.168.1.1")]);
        assert_eq!(client_ip(&h), "10.0.0.1");
    }

    #[test]
    fn test_real_ip() {
        let h = headers(&[("x-real-ip", " ::1 ")]);
        assert_eq!(client_ip(&h), "::1");
    }

    #[test]
    fn test_blank_forwarded_for_falls_through() {
        let h = headers(&[("x-forwarded-for", "  "), ("x-real-ip", "203.0.113.50")]);
        assert_eq!(client_ip(&h), "203.0.113.50");
        assert_eq!(client_ip(&headers(&[("x-forwarded-for", " , ")])), UNKNOWN_IP);
    }

    #[test]
    fn test_unknown_is_borrowed() {
        let ip = client_ip(&HeaderMap::new());
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_long_proxy_chain() {
        let chain = (0..100)
            .map(|i| format!("10.0.0.{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_str(&chain).unwrap());
        assert_eq!(client_ip(&h), "10.0.0.0");
    }
}
