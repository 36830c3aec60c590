//! Routing, with each route group behind its named middleware stack.
//!
//! # Route Groups
//!
//! | Stack         | Routes                                                  |
//! |---------------|---------------------------------------------------------|
//! | `Light`       | `GET /health`                                           |
//! | `Full`        | `GET /queries`, `GET /queries/{id}`, `POST /data/execute/{queryId}`, `GET /data/stats`, unmatched paths |
//! | `CustomQuery` | `POST /data/execute-custom/{collection}`                |
//! | `Admin`       | `POST /admin/ensure-indexes`                            |
//!
//! Every group applies its stack before the groups are merged, so a route
//! never runs under two stacks.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tracing::info;

use crate::handlers;
use crate::middleware::{MiddlewareStack, StackKind};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let settings = state.pipeline_settings();
    let stack = |kind| MiddlewareStack::new(kind, &settings);

    let light = stack(StackKind::Light)
        .apply(Router::new().route("/health", get(handlers::health_check)));

    let full = stack(StackKind::Full).apply(
        Router::new()
            .route("/queries", get(handlers::list_queries))
            .route("/queries/{id}", get(handlers::get_query))
            .route("/data/execute/{query_id}", post(handlers::execute_query))
            .route("/data/stats", get(handlers::stats))
            .fallback(handlers::not_found),
    );

    let custom_query = stack(StackKind::CustomQuery).apply(Router::new().route(
        "/data/execute-custom/{collection}",
        post(handlers::execute_custom_query),
    ));

    let admin = stack(StackKind::Admin).apply(
        Router::new().route("/admin/ensure-indexes", post(handlers::ensure_indexes)),
    );

    info!(
        max_size_kb = state.config.max_request_body_size / 1024,
        "Request body size limit configured"
    );

    Router::new()
        .merge(light)
        .merge(full)
        .merge(custom_query)
        .merge(admin)
        .layer(DefaultBodyLimit::max(state.config.max_request_body_size))
        .with_state(state)
}
