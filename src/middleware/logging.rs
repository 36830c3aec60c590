//! Request logging and request id propagation.
//!
//! Runs around everything except error translation, so rate-limited and
//! failed requests are logged with the status and latency of the response
//! the client actually receives. One event is emitted per request; its
//! level follows the outcome:
//!
//! | Outcome                         | Level   |
//! |---------------------------------|---------|
//! | internal error or handler panic | `error` |
//! | status >= 400                   | `warn`  |
//! | otherwise                       | `info`  |
//!
//! Request ids come from `X-Request-Id` when the client sends one, else a
//! fresh UUIDv4. The id is written back to the request (for handlers) and
//! echoed on the response.

use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, HttpBody};
use axum::extract::MatchedPath;
use axum::http::{HeaderMap, HeaderValue, Request, Response, header};
use tower::{Layer, Service};
use tracing::Level;
use uuid::Uuid;

use super::ip::client_ip;
use crate::error::ApiError;
use crate::metrics;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Label for requests that matched no route, keeping metric cardinality bounded.
const UNMATCHED_PATH: &str = "unmatched";

/// One completed request.
#[derive(Debug, Clone)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub status: u16,
    pub latency_ms: f64,
    pub response_size: Option<u64>,
    pub error: Option<String>,
}

impl RequestLogEntry {
    /// Level for this entry: `error` when `internal`, `warn` on 4xx/5xx, else `info`.
    pub fn level(&self, internal: bool) -> Level {
        if internal {
            Level::ERROR
        } else if self.status >= 400 {
            Level::WARN
        } else {
            Level::INFO
        }
    }
}

pub fn log_request(entry: &RequestLogEntry, level: Level) {
    macro_rules! emit {
        ($macro:ident) => {
            tracing::$macro!(
                request_id = %entry.request_id,
                method = %entry.method,
                path = %entry.path,
                client_ip = %entry.client_ip,
                user_agent = entry.user_agent.as_deref(),
                referer = entry.referer.as_deref(),
                status = entry.status,
                latency_ms = entry.latency_ms,
                response_size = entry.response_size,
                error = entry.error.as_deref(),
                "HTTP request"
            )
        };
    }

    match level {
        Level::ERROR => emit!(error),
        Level::WARN => emit!(warn),
        _ => emit!(info),
    }
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Request id from the incoming headers, or a new UUIDv4.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> String {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = value.to_str()
        && !value.trim().is_empty()
    {
        return value.trim().to_string();
    }
    Uuid::new_v4().to_string()
}

#[derive(Clone, Default)]
pub struct RequestLoggerLayer;

impl RequestLoggerLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggerService { inner }
    }
}

#[derive(Clone)]
pub struct RequestLoggerService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestLoggerService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let start = Instant::now();
        let request_id = extract_or_generate_request_id(&req);
        let header_value = HeaderValue::from_str(&request_id).ok();
        if let Some(value) = &header_value {
            req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        }

        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let route = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| UNMATCHED_PATH.to_string());
        let client_ip = client_ip(req.headers()).into_owned();
        let user_agent = header_string(req.headers(), header::USER_AGENT);
        let referer = header_string(req.headers(), header::REFERER);

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            let elapsed = start.elapsed();

            if let Some(value) = header_value {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }

            let api_error = response.extensions().get::<ApiError>();
            let internal = api_error.is_some_and(ApiError::is_internal);
            let entry = RequestLogEntry {
                request_id,
                method,
                path,
                client_ip,
                user_agent,
                referer,
                status: response.status().as_u16(),
                latency_ms: elapsed.as_secs_f64() * 1000.0,
                response_size: response.body().size_hint().exact(),
                error: api_error.map(ToString::to_string),
            };
            log_request(&entry, entry.level(internal));
            metrics::record_request_duration(
                &route,
                &entry.method,
                &entry.status.to_string(),
                elapsed.as_secs_f64(),
            );

            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn entry(status: u16) -> RequestLogEntry {
        RequestLogEntry {
            request_id: "id".into(),
            method: "GET".into(),
            path: "/".into(),
            client_ip: "unknown".into(),
            user_agent: None,
            referer: None,
            status,
            latency_ms: 1.0,
            response_size: Some(2),
            error: None,
        }
    }

    #[test]
    fn test_level_escalation() {
        assert_eq!(entry(200).level(false), Level::INFO);
        assert_eq!(entry(302).level(false), Level::INFO);
        assert_eq!(entry(404).level(false), Level::WARN);
        assert_eq!(entry(429).level(false), Level::WARN);
        assert_eq!(entry(500).level(true), Level::ERROR);
    }

    #[test]
    fn test_extract_existing_request_id() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "existing-id-123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_or_generate_request_id(&req), "existing-id-123");
    }

    #[test]
    fn test_blank_request_id_is_replaced() {
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "  ")
            .body(Body::empty())
            .unwrap();
        assert!(Uuid::parse_str(&extract_or_generate_request_id(&req)).is_ok());
    }
}
