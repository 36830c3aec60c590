//! Index maintenance, served under the admin stack.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use tracing::{info, instrument};

use crate::error::ApiResult;
use crate::models::{DataResponse, EnsureIndexesParams, IndexReport};
use crate::state::AppState;
use crate::store::standard_indexes;

/// `POST /admin/ensure-indexes?recreate=bool`
///
/// Creates the text and geospatial indexes that are missing. With
/// `recreate=true` every index is dropped first.
#[instrument(skip(state, params))]
pub async fn ensure_indexes(
    State(state): State<AppState>,
    params: Result<Query<EnsureIndexesParams>, QueryRejection>,
) -> ApiResult<Json<DataResponse<IndexReport>>> {
    let Query(params) = params?;

    let dropped = if params.recreate {
        state.indexes.drop_indexes().await?
    } else {
        0
    };
    let specs = standard_indexes();
    let created = state.indexes.ensure_indexes(&specs).await?;

    let mut indexes = Vec::new();
    let mut collections: Vec<&str> = specs.iter().map(|s| s.collection.as_str()).collect();
    collections.sort_unstable();
    collections.dedup();
    for collection in collections {
        indexes.extend(state.indexes.list_indexes(collection).await?);
    }

    info!(dropped, created = created.len(), total = indexes.len(), "Indexes ensured");
    Ok(Json(DataResponse::ok(IndexReport {
        dropped,
        created,
        indexes,
    })))
}
