//! Outermost error translation and panic recovery.
//!
//! Handlers and middleware return [`ApiError`]s that render with the
//! redacting production translator and leave the error in the response
//! extensions. [`ErrorTranslatorLayer`] sits outside every other layer and
//! re-renders those with the configured translator, so development builds
//! see raw internal messages. Error statuses produced without an
//! [`ApiError`] (405 from the router, 413 from the body limit) get the same
//! envelope.
//!
//! Panics are caught by `tower_http`'s `CatchPanicLayer` with
//! [`PanicHandler`], which turns them into an internal error.

use std::any::Any;
use std::task::{Context, Poll};

use axum::Json;
use axum::body::Body;
use axum::http::{HeaderValue, Request, Response, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tower_http::catch_panic::ResponseForPanic;
use tracing::error;

use crate::error::{ApiError, ErrorTranslator};

#[derive(Debug, Clone, Copy)]
pub struct ErrorTranslatorLayer {
    translator: ErrorTranslator,
}

impl ErrorTranslatorLayer {
    pub fn new(translator: ErrorTranslator) -> Self {
        Self { translator }
    }
}

impl<S> Layer<S> for ErrorTranslatorLayer {
    type Service = ErrorTranslatorService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorTranslatorService {
            inner,
            translator: self.translator,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorTranslatorService<S> {
    inner: S,
    translator: ErrorTranslator,
}

impl<S> Service<Request<Body>> for ErrorTranslatorService<S>
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
        let translator = self.translator;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;
            Ok(translate(translator, response))
        })
    }
}

/// Give an error response the envelope `translator` would produce.
///
/// Headers set by inner layers (rate limit, CORS, security) are kept.
pub fn translate(translator: ErrorTranslator, response: Response<Body>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();

    let api_error = parts.extensions.get::<ApiError>().cloned();
    let rendered = match api_error {
        // Production rendering already happened in `IntoResponse`.
        Some(_) if !translator.is_development() => return Response::from_parts(parts, body),
        Some(err) => {
            let (envelope, _) = translator.handle(&err);
            Json(envelope).into_response()
        }
        None if parts.status.is_client_error() || parts.status.is_server_error() => {
            if is_json(&parts.headers) {
                return Response::from_parts(parts, body);
            }
            Json(translator.handle_status(parts.status)).into_response()
        }
        None => return Response::from_parts(parts, body),
    };

    let (rendered_parts, rendered_body) = rendered.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    if let Some(content_type) = rendered_parts.headers.get(header::CONTENT_TYPE) {
        parts.headers.insert(header::CONTENT_TYPE, content_type.clone());
    }
    Response::from_parts(parts, rendered_body)
}

fn is_json(headers: &axum::http::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v: &HeaderValue| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

/// Converts a caught panic into an internal error response.
#[derive(Debug, Clone, Copy)]
pub struct PanicHandler {
    stage: &'static str,
}

impl PanicHandler {
    /// `stage` names the part of the pipeline the panic came from.
    pub fn new(stage: &'static str) -> Self {
        Self { stage }
    }
}

impl ResponseForPanic for PanicHandler {
    type ResponseBody = Body;

    fn response_for_panic(&mut self, err: Box<dyn Any + Send + 'static>) -> Response<Body> {
        let detail = if let Some(s) = err.downcast_ref::<String>() {
            s.clone()
        } else if let Some(s) = err.downcast_ref::<&str>() {
            (*s).to_string()
        } else {
            "unknown panic payload".to_string()
        };
        error!(stage = self.stage, panic = %detail, "Request processing panicked");
        ApiError::internal(format!("Panic in {}: {detail}", self.stage)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::Value;

    async fn body_json(response: Response<Body>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_development_reveals_internal_message() {
        let mut response = ApiError::internal("db exploded").into_response();
        response
            .headers_mut()
            .insert("x-ratelimit-limit", HeaderValue::from_static("100"));

        let translated = translate(ErrorTranslator::new(true), response);
        assert_eq!(translated.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(translated.headers()["x-ratelimit-limit"], "100");
        let body = body_json(translated).await;
        assert_eq!(body["message"], "db exploded");
    }

    #[tokio::test]
    async fn test_production_keeps_redacted_message() {
        let response = ApiError::internal("db exploded").into_response();
        let body = body_json(translate(ErrorTranslator::production(), response)).await;
        assert_eq!(body["message"], crate::error::REDACTED_INTERNAL_MESSAGE);
        assert_eq!(body["error"], "internal_error");
    }

    #[tokio::test]
    async fn test_bare_error_status_gets_envelope() {
        let response = Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::empty())
            .unwrap();
        let translated = translate(ErrorTranslator::production(), response);
        assert_eq!(translated.status(), StatusCode::METHOD_NOT_ALLOWED);
        let body = body_json(translated).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["statusCode"], 405);
        assert_eq!(body["error"], "method_not_allowed");
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let response = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap();
        let translated = translate(ErrorTranslator::new(true), response);
        assert_eq!(translated.status(), StatusCode::NO_CONTENT);
        assert!(!translated.headers().contains_key(header::CONTENT_TYPE));
    }

    #[tokio::test]
    async fn test_panic_handler_renders_internal_error() {
        let mut handler = PanicHandler::new("handler");
        let response = handler.response_for_panic(Box::new("boom"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.extensions().get::<ApiError>().is_some_and(ApiError::is_internal));

        let translated = translate(ErrorTranslator::new(true), response);
        let body = body_json(translated).await;
        assert_eq!(body["message"], "Panic in handler: boom");
    }
}
