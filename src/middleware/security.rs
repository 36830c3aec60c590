//! Security response headers.
//!
//! The default profile is suited to anything a browser might render. The
//! [`SecurityPolicy::api`] profile drops the content security policy and
//! frame denial, which mean nothing for JSON, and relaxes
//! `Cross-Origin-Resource-Policy` to `cross-origin` so other sites may
//! fetch the data endpoints.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, Response, header};
use tower::{Layer, Service};

const DEFAULT_CSP: &str = "default-src 'self';base-uri 'self';font-src 'self' https: data:;\
form-action 'self';frame-ancestors 'self';img-src 'self' data:;object-src 'none';\
script-src 'self';script-src-attr 'none';style-src 'self' https: 'unsafe-inline';\
upgrade-insecure-requests";

const HSTS: &str = "max-age=31536000; includeSubDomains";

/// Header classes that can be switched off per profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub content_security_policy: Option<String>,
    pub frame_options: bool,
    pub hsts: bool,
    pub cross_origin_resource_policy: &'static str,
    pub cross_origin_opener_policy: &'static str,
    pub cross_origin_embedder_policy: bool,
    pub referrer_policy: &'static str,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            content_security_policy: Some(DEFAULT_CSP.to_string()),
            frame_options: true,
            hsts: true,
            cross_origin_resource_policy: "same-origin",
            cross_origin_opener_policy: "same-origin",
            cross_origin_embedder_policy: true,
            referrer_policy: "no-referrer",
        }
    }
}

impl SecurityPolicy {
    pub fn api() -> Self {
        Self {
            content_security_policy: None,
            frame_options: false,
            cross_origin_resource_policy: "cross-origin",
            cross_origin_embedder_policy: false,
            ..Self::default()
        }
    }

    /// Set the configured headers and strip `X-Powered-By`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.remove("x-powered-by");

        if let Some(csp) = &self.content_security_policy
            && let Ok(value) = HeaderValue::from_str(csp)
        {
            headers.insert(header::CONTENT_SECURITY_POLICY, value);
        }
        if self.frame_options {
            headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
        }
        if self.hsts {
            headers.insert(header::STRICT_TRANSPORT_SECURITY, HeaderValue::from_static(HSTS));
        }
        if self.cross_origin_embedder_policy {
            set(headers, "cross-origin-embedder-policy", "require-corp");
        }

        set(headers, "cross-origin-resource-policy", self.cross_origin_resource_policy);
        set(headers, "cross-origin-opener-policy", self.cross_origin_opener_policy);
        headers.insert(header::REFERRER_POLICY, HeaderValue::from_static(self.referrer_policy));
        headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        headers.insert(header::X_DNS_PREFETCH_CONTROL, HeaderValue::from_static("off"));
        headers.insert(header::X_XSS_PROTECTION, HeaderValue::from_static("0"));
        set(headers, "x-download-options", "noopen");
        set(headers, "x-permitted-cross-domain-policies", "none");
        set(headers, "origin-agent-cluster", "?1");
    }
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &'static str) {
    headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
}

#[derive(Debug, Clone)]
pub struct SecurityHeadersLayer {
    policy: Arc<SecurityPolicy>,
}

impl SecurityHeadersLayer {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for SecurityHeadersLayer {
    type Service = SecurityHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SecurityHeadersService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityHeadersService<S> {
    inner: S,
    policy: Arc<SecurityPolicy>,
}

impl<S> Service<Request<Body>> for SecurityHeadersService<S>
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
        let policy = self.policy.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            policy.apply_headers(response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_sets_full_header_set() {
        let mut headers = HeaderMap::new();
        headers.insert("x-powered-by", HeaderValue::from_static("Express"));
        SecurityPolicy::default().apply_headers(&mut headers);

        assert!(!headers.contains_key("x-powered-by"));
        assert!(headers.contains_key(header::CONTENT_SECURITY_POLICY));
        assert_eq!(headers[header::X_FRAME_OPTIONS], "SAMEORIGIN");
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::STRICT_TRANSPORT_SECURITY], HSTS);
        assert_eq!(headers["cross-origin-resource-policy"], "same-origin");
        assert_eq!(headers["cross-origin-embedder-policy"], "require-corp");
    }

    #[test]
    fn test_api_profile_drops_csp_and_frame_denial() {
        let mut headers = HeaderMap::new();
        SecurityPolicy::api().apply_headers(&mut headers);

        assert!(!headers.contains_key(header::CONTENT_SECURITY_POLICY));
        assert!(!headers.contains_key(header::X_FRAME_OPTIONS));
        assert!(!headers.contains_key("cross-origin-embedder-policy"));
        assert_eq!(headers["cross-origin-resource-policy"], "cross-origin");
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::REFERRER_POLICY], "no-referrer");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let policy = SecurityPolicy::api();
        let mut once = HeaderMap::new();
        policy.apply_headers(&mut once);
        let mut twice = once.clone();
        policy.apply_headers(&mut twice);
        assert_eq!(once, twice);
    }
}
