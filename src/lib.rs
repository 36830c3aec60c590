//! # Query Gateway
//!
//! A read-only query service on Axum:
//!
//! - **Catalog queries**: named, parameterized reads with defaults, including
//!   text and geospatial searches that fall back gracefully when the store
//!   lacks the index they need
//! - **Custom queries**: caller-supplied filters and pipelines, validated
//!   against a collection allow-list, an operation allow-list and a
//!   mutating-verb blacklist before they reach the store
//! - **Pipeline**: error translation, request logging, per-client rate
//!   limiting, security headers and CORS, in that order, around every route
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Errors → Logger → Rate Limit → Security → CORS)│
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, queries, data, admin)                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  QueryExecutor (catalog)   │  CustomQueryGateway            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  DocumentStore (read-only) │  IndexManager                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  MemoryStore (JSON documents, text + 2dsphere indexes)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use query_gateway::{AppState, Config, build_router};
//! use query_gateway::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(MemoryStore::load("data/seed.json").await?);
//!     let app = build_router(AppState::new(config, store));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod query;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::build_router;
pub use state::AppState;
