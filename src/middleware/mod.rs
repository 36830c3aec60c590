//! HTTP middleware pipeline.
//!
//! Every route runs behind one of four named stacks. Components apply
//! outside-in in a fixed order:
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ErrorTranslator  ← re-renders every error envelope with the configured mode
//!    │
//! RequestLogger    ← one event per request, X-Request-Id
//!    │
//! RateLimiter      ← 429 + Retry-After, X-RateLimit-* on every response
//!    │
//! SecurityHeaders  ← nosniff, HSTS, CORP...
//!    │
//! Cors             ← answers preflights, echoes allowed origins
//!    │
//!    ▼
//! Handler
//! ```
//!
//! | Stack          | Rate limit profile | CORS   | Security |
//! |----------------|--------------------|--------|----------|
//! | `Full`         | api                | api    | api      |
//! | `CustomQuery`  | custom query       | api    | api      |
//! | `Light`        | none               | api    | api      |
//! | `Admin`        | api                | strict | default  |
//!
//! Panics inside the handler become `500` internal errors that still carry
//! every header layer's output. Panics in the rate limiter, security headers
//! or CORS are caught just inside the request logger, so they are logged and
//! translated like any other error.

pub mod cors;
pub mod error_handler;
pub mod ip;
pub mod logging;
pub mod rate_limit;
pub mod security;
pub mod timeout;

use std::sync::Arc;

use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;

pub use cors::{CorsLayer, CorsPolicy, OriginPolicy};
pub use error_handler::{ErrorTranslatorLayer, PanicHandler};
pub use ip::{UNKNOWN_IP, client_ip};
pub use logging::{REQUEST_ID_HEADER, RequestLoggerLayer};
pub use rate_limit::{FixedWindowLimiter, RateDecision, RateLimitLayer, RateLimiter};
pub use security::{SecurityHeadersLayer, SecurityPolicy};
pub use timeout::{ClientTimeout, REQUEST_TIMEOUT_HEADER};

use crate::error::ErrorTranslator;

/// Named middleware stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Full,
    CustomQuery,
    Light,
    Admin,
}

impl StackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::CustomQuery => "custom_query",
            Self::Light => "light",
            Self::Admin => "admin",
        }
    }
}

/// What the stacks are built from.
///
/// Limiters are shared: every route under the same stack kind counts
/// against the same buckets.
#[derive(Clone)]
pub struct PipelineSettings {
    pub translator: ErrorTranslator,
    pub api_limiter: Arc<dyn RateLimiter>,
    pub custom_query_limiter: Arc<dyn RateLimiter>,
    pub strict_cors: CorsPolicy,
}

/// One cross-cutting concern.
#[derive(Clone)]
pub enum Component {
    ErrorTranslator(ErrorTranslatorLayer),
    RequestLogger(RequestLoggerLayer),
    RateLimiter(RateLimitLayer),
    SecurityHeaders(SecurityHeadersLayer),
    Cors(CorsLayer),
}

impl Component {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ErrorTranslator(_) => "error_translator",
            Self::RequestLogger(_) => "request_logger",
            Self::RateLimiter(_) => "rate_limiter",
            Self::SecurityHeaders(_) => "security_headers",
            Self::Cors(_) => "cors",
        }
    }

    /// Position in the required outside-in order.
    fn rank(&self) -> u8 {
        match self {
            Self::ErrorTranslator(_) => 0,
            Self::RequestLogger(_) => 1,
            Self::RateLimiter(_) => 2,
            Self::SecurityHeaders(_) => 3,
            Self::Cors(_) => 4,
        }
    }
}

/// An ordered, outermost-first list of components.
#[derive(Clone)]
pub struct MiddlewareStack {
    kind: StackKind,
    components: Vec<Component>,
}

impl MiddlewareStack {
    pub fn new(kind: StackKind, settings: &PipelineSettings) -> Self {
        let translator = Component::ErrorTranslator(ErrorTranslatorLayer::new(settings.translator));
        let logger = Component::RequestLogger(RequestLoggerLayer::new());
        let api_security = Component::SecurityHeaders(SecurityHeadersLayer::new(SecurityPolicy::api()));
        let api_cors = Component::Cors(CorsLayer::new(CorsPolicy::api()));

        let components = match kind {
            StackKind::Full => vec![
                translator,
                logger,
                Component::RateLimiter(RateLimitLayer::new(settings.api_limiter.clone(), "api")),
                api_security,
                api_cors,
            ],
            StackKind::CustomQuery => vec![
                translator,
                logger,
                Component::RateLimiter(RateLimitLayer::new(
                    settings.custom_query_limiter.clone(),
                    "custom_query",
                )),
                api_security,
                api_cors,
            ],
            StackKind::Light => vec![translator, logger, api_security, api_cors],
            StackKind::Admin => vec![
                translator,
                logger,
                Component::RateLimiter(RateLimitLayer::new(settings.api_limiter.clone(), "api")),
                Component::SecurityHeaders(SecurityHeadersLayer::new(SecurityPolicy::default())),
                Component::Cors(CorsLayer::new(settings.strict_cors.clone())),
            ],
        };

        Self { kind, components }
    }

    pub fn kind(&self) -> StackKind {
        self.kind
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Component names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.components.iter().map(Component::name).collect()
    }

    /// Wrap every route of `router` (and its fallback) in this stack.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        compose(router, &self.components)
    }
}

/// Apply `components` (outermost first) to `router`.
///
/// Components are sorted into the required order first, so a caller cannot
/// put CORS outside the rate limiter or logging outside error translation.
pub fn compose<S>(router: Router<S>, components: &[Component]) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let mut ordered = components.to_vec();
    ordered.sort_by_key(Component::rank);

    // `Router::layer` wraps what is already there, so apply innermost first.
    let mut router = router.layer(CatchPanicLayer::custom(PanicHandler::new("handler")));
    for component in ordered.iter().rev() {
        router = match component {
            Component::ErrorTranslator(layer) => router.layer(*layer),
            // Panics below the logger still produce a logged response.
            Component::RequestLogger(layer) => router
                .layer(CatchPanicLayer::custom(PanicHandler::new("middleware")))
                .layer(layer.clone()),
            Component::RateLimiter(layer) => router.layer(layer.clone()),
            Component::SecurityHeaders(layer) => router.layer(layer.clone()),
            Component::Cors(layer) => router.layer(layer.clone()),
        };
    }
    router
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RateLimitProfile;
    use std::time::Duration;

    fn settings() -> PipelineSettings {
        PipelineSettings {
            translator: ErrorTranslator::production(),
            api_limiter: Arc::new(FixedWindowLimiter::new("api", RateLimitProfile::api())),
            custom_query_limiter: Arc::new(FixedWindowLimiter::new(
                "custom_query",
                RateLimitProfile::new(Duration::from_secs(300), 20),
            )),
            strict_cors: CorsPolicy::strict(Vec::new()),
        }
    }

    #[test]
    fn test_full_stack_order() {
        let stack = MiddlewareStack::new(StackKind::Full, &settings());
        assert_eq!(
            stack.names(),
            vec!["error_translator", "request_logger", "rate_limiter", "security_headers", "cors"]
        );
    }

    #[test]
    fn test_light_stack_has_no_rate_limiter() {
        let stack = MiddlewareStack::new(StackKind::Light, &settings());
        assert!(!stack.names().contains(&"rate_limiter"));
        assert_eq!(stack.components().len(), 4);
    }

    #[test]
    fn test_custom_query_and_admin_stacks_keep_all_components() {
        for kind in [StackKind::CustomQuery, StackKind::Admin] {
            let stack = MiddlewareStack::new(kind, &settings());
            assert_eq!(stack.components().len(), 5, "{}", kind.as_str());
        }
    }
}
