//! CORS negotiation.
//!
//! A request is a preflight iff its method is `OPTIONS` and it carries
//! `Access-Control-Request-Method`. Preflights are answered here with
//! `204 No Content` and never reach the handler. Actual requests get only
//! the origin, credentials and exposed-header fields; methods and allowed
//! headers are preflight-only.

use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, header};
use tower::{Layer, Service};

use super::rate_limit::{RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET};

const DEFAULT_MAX_AGE_SECS: u64 = 86_400;

/// Which origins may read responses.
///
/// Evaluated in declaration order of the variants.
#[derive(Clone)]
pub enum OriginPolicy {
    Any,
    Deny,
    Exact(String),
    List(Vec<String>),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl fmt::Debug for OriginPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("Any"),
            Self::Deny => f.write_str("Deny"),
            Self::Exact(origin) => f.debug_tuple("Exact").field(origin).finish(),
            Self::List(origins) => f.debug_tuple("List").field(origins).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl OriginPolicy {
    pub fn allows(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Deny => false,
            Self::Exact(allowed) => allowed == origin,
            Self::List(allowed) => allowed.iter().any(|o| o == origin),
            Self::Predicate(predicate) => predicate(origin),
        }
    }
}

/// CORS settings for one middleware stack.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    pub origins: OriginPolicy,
    pub methods: Vec<Method>,
    /// Headers a preflight may request. Requested headers outside this list
    /// are dropped from the answer.
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub credentials: bool,
    pub max_age_secs: u64,
}

impl CorsPolicy {
    /// Permissive profile for the data endpoints.
    pub fn api() -> Self {
        Self {
            origins: OriginPolicy::Any,
            methods: vec![Method::GET, Method::POST, Method::OPTIONS],
            allowed_headers: default_allowed_headers(),
            exposed_headers: default_exposed_headers(),
            credentials: false,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }

    /// Explicit allow-list; an empty list denies every cross-origin caller.
    pub fn strict(origins: Vec<String>) -> Self {
        let origins = if origins.is_empty() {
            OriginPolicy::Deny
        } else {
            OriginPolicy::List(origins)
        };
        Self {
            origins,
            methods: vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
                Method::OPTIONS,
            ],
            allowed_headers: default_allowed_headers(),
            exposed_headers: default_exposed_headers(),
            credentials: true,
            max_age_secs: DEFAULT_MAX_AGE_SECS,
        }
    }

    pub fn is_preflight<B>(request: &Request<B>) -> bool {
        request.method() == Method::OPTIONS
            && request
                .headers()
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    }

    /// Origin value to send back, if any.
    fn allow_origin(&self, origin: Option<&str>) -> Option<HeaderValue> {
        match origin {
            Some(origin) if self.origins.allows(origin) => HeaderValue::from_str(origin).ok(),
            Some(_) => None,
            None => matches!(self.origins, OriginPolicy::Any).then(|| HeaderValue::from_static("*")),
        }
    }

    fn apply_origin(&self, origin: Option<&str>, headers: &mut HeaderMap) {
        if origin.is_some() {
            headers.append(header::VARY, HeaderValue::from_static("Origin"));
        }
        let Some(value) = self.allow_origin(origin) else {
            return;
        };
        let wildcard = value == "*";
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        // Browsers refuse credentials together with a wildcard origin.
        if self.credentials && !wildcard {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
    }

    /// Add origin, credential and exposed-header fields to an actual response.
    pub fn apply_headers(&self, origin: Option<&str>, headers: &mut HeaderMap) {
        self.apply_origin(origin, headers);
        if headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            && !self.exposed_headers.is_empty()
            && let Ok(value) = HeaderValue::from_str(&self.exposed_headers.join(", "))
        {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
    }

    /// Answer a preflight request.
    pub fn handle_preflight<B>(&self, request: &Request<B>) -> Response<Body> {
        let origin = origin_of(request.headers());
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        let headers = response.headers_mut();

        self.apply_origin(origin, headers);
        if !headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN) {
            return response;
        }

        let methods = self
            .methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&methods) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }

        let requested = request
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .and_then(|v| v.to_str().ok());
        let negotiated = self.negotiate_headers(requested);
        if !negotiated.is_empty()
            && let Ok(value) = HeaderValue::from_str(&negotiated)
        {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }

        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from(self.max_age_secs),
        );
        headers.append(
            header::VARY,
            HeaderValue::from_static("Access-Control-Request-Method, Access-Control-Request-Headers"),
        );
        response
    }

    /// Requested headers that are allowed, or the full list when none were requested.
    fn negotiate_headers(&self, requested: Option<&str>) -> String {
        let Some(requested) = requested else {
            return self.allowed_headers.join(", ");
        };
        requested
            .split(',')
            .map(str::trim)
            .filter(|name| {
                !name.is_empty()
                    && self
                        .allowed_headers
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(name))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn default_allowed_headers() -> Vec<String> {
    [
        "Content-Type",
        "Authorization",
        "X-Requested-With",
        "X-Request-Id",
        "X-Request-Timeout",
    ]
    .map(String::from)
    .to_vec()
}

fn default_exposed_headers() -> Vec<String> {
    [RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET, "x-request-id"]
        .map(String::from)
        .to_vec()
}

fn origin_of(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::ORIGIN).and_then(|v| v.to_str().ok())
}

/// Tower layer applying a [`CorsPolicy`].
#[derive(Debug, Clone)]
pub struct CorsLayer {
    policy: Arc<CorsPolicy>,
}

impl CorsLayer {
    pub fn new(policy: CorsPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for CorsLayer {
    type Service = CorsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorsService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorsService<S> {
    inner: S,
    policy: Arc<CorsPolicy>,
}

impl<S> Service<Request<Body>> for CorsService<S>
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

        if CorsPolicy::is_preflight(&req) {
            let response = policy.handle_preflight(&req);
            return Box::pin(async move { Ok(response) });
        }

        let origin = origin_of(req.headers()).map(str::to_string);
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            policy.apply_headers(origin.as_deref(), response.headers_mut());
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn preflight(origin: &str, headers: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::OPTIONS)
            .uri("/data/execute/x")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST");
        if let Some(headers) = headers {
            builder = builder.header(header::ACCESS_CONTROL_REQUEST_HEADERS, headers);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_preflight_detection() {
        assert!(CorsPolicy::is_preflight(&preflight("https://a.test", None)));
        let plain_options = Request::builder()
            .method(Method::OPTIONS)
            .uri("/")
            .body(Body::empty())
            .unwrap();
        assert!(!CorsPolicy::is_preflight(&plain_options));
    }

    #[test]
    fn test_origin_policy_shapes() {
        assert!(OriginPolicy::Any.allows("https://x.test"));
        assert!(!OriginPolicy::Deny.allows("https://x.test"));
        assert!(OriginPolicy::Exact("https://x.test".into()).allows("https://x.test"));
        assert!(!OriginPolicy::Exact("https://x.test".into()).allows("https://y.test"));
        let list = OriginPolicy::List(vec!["https://a.test".into(), "https://b.test".into()]);
        assert!(list.allows("https://b.test"));
        let predicate = OriginPolicy::Predicate(Arc::new(|o: &str| o.ends_with(".example.com")));
        assert!(predicate.allows("https://app.example.com"));
        assert!(!predicate.allows("https://evil.test"));
    }

    #[test]
    fn test_allowed_origin_is_echoed_with_vary() {
        let policy = CorsPolicy::strict(vec!["https://app.test".into()]);
        let mut headers = HeaderMap::new();
        policy.apply_headers(Some("https://app.test"), &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.test");
        assert_eq!(headers[header::VARY], "Origin");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[test]
    fn test_api_profile_echoes_any_origin() {
        let mut headers = HeaderMap::new();
        CorsPolicy::api().apply_headers(Some("https://anything.test"), &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://anything.test");
        assert!(headers.contains_key(header::ACCESS_CONTROL_EXPOSE_HEADERS));
    }

    #[test]
    fn test_missing_origin_under_any_is_wildcard() {
        let mut headers = HeaderMap::new();
        CorsPolicy::api().apply_headers(None, &mut headers);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(!headers.contains_key(header::VARY));

        let mut headers = HeaderMap::new();
        CorsPolicy::strict(vec!["https://app.test".into()]).apply_headers(None, &mut headers);
        assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[test]
    fn test_disallowed_origin_gets_no_allow_header() {
        let mut headers = HeaderMap::new();
        CorsPolicy::strict(Vec::new()).apply_headers(Some("https://app.test"), &mut headers);
        assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(headers[header::VARY], "Origin");
    }

    #[test]
    fn test_preflight_negotiates_requested_headers() {
        let policy = CorsPolicy::api();
        let response = policy.handle_preflight(&preflight(
            "https://app.test",
            Some("content-type, x-secret"),
        ));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "content-type");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
    }

    #[test]
    fn test_preflight_for_denied_origin_has_no_cors_headers() {
        let policy = CorsPolicy::strict(vec!["https://app.test".into()]);
        let response = policy.handle_preflight(&preflight("https://evil.test", None));
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!response.headers().contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }
}
