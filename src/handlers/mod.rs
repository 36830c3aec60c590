mod admin;
mod data;
mod health;
mod queries;

use axum::http::Uri;

use crate::error::ApiError;

pub use admin::ensure_indexes;
pub use data::{execute_custom_query, execute_query, stats};
pub use health::health_check;
pub use queries::{get_query, list_queries};

/// Fallback for unmatched paths.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("Route {} not found", uri.path()))
}
