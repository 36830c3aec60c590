//! Liveness endpoint, served under the light stack (no rate limit).

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// `GET /health`
///
/// ```json
/// {
///   "status": "OK",
///   "timestamp": "2024-01-15T10:30:00Z",
///   "uptime": 3600.5,
///   "environment": "production",
///   "version": "0.1.0"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
        timestamp: Utc::now(),
        uptime: state.uptime_seconds(),
        environment: state.config.environment.as_str().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
