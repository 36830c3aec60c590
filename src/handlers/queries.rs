//! Catalog listing.

use axum::Json;
use axum::extract::{Path, State};
use tracing::instrument;

use crate::error::{ApiError, ApiResult};
use crate::models::{DataResponse, QueryListResponse};
use crate::query::catalog::DefinitionSummary;
use crate::state::AppState;

/// `GET /queries`
#[instrument(skip(state))]
pub async fn list_queries(State(state): State<AppState>) -> Json<QueryListResponse> {
    let data: Vec<DefinitionSummary> = state
        .executor
        .catalog()
        .iter()
        .map(|definition| definition.summary())
        .collect();

    Json(QueryListResponse {
        success: true,
        count: data.len(),
        data,
    })
}

/// `GET /queries/{id}`
#[instrument(skip(state))]
pub async fn get_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DataResponse<DefinitionSummary>>> {
    let definition = state
        .executor
        .catalog()
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("Query '{id}' not found")))?;

    Ok(Json(DataResponse::ok(definition.summary())))
}
