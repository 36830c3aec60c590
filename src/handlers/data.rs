//! Query execution endpoints.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use chrono::Utc;
use serde_json::json;
use tracing::instrument;

use crate::error::ApiResult;
use crate::middleware::ClientTimeout;
use crate::models::{
    CustomQueryMetadata, DataResponse, ExecuteMetadata, ExecuteRequest, ExecuteResponse,
    StatsResponse,
};
use crate::query::{Collection, CustomQueryRequest};
use crate::state::AppState;

/// `POST /data/execute/{queryId}`
///
/// Body `{"parameters": {...}}`; a missing body or missing `parameters`
/// runs the query with its defaults.
#[instrument(skip(state, body))]
pub async fn execute_query(
    State(state): State<AppState>,
    Path(query_id): Path<String>,
    timeout: ClientTimeout,
    body: Result<Json<ExecuteRequest>, JsonRejection>,
) -> ApiResult<Json<ExecuteResponse<ExecuteMetadata>>> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => ExecuteRequest::default(),
        Err(rejection) => return Err(rejection.into()),
    };

    let timeout = timeout.effective(state.executor.timeout());
    let result = state
        .executor
        .execute_within(&query_id, &request.parameters, timeout)
        .await?;

    // Echo what actually ran: caller parameters over the defaults.
    let parameters = state
        .executor
        .catalog()
        .get(&query_id)
        .map(|definition| definition.parameters(&request.parameters).as_map().clone())
        .unwrap_or(request.parameters);

    Ok(Json(ExecuteResponse {
        success: true,
        data: result.data,
        metadata: ExecuteMetadata {
            query_id,
            execution_time: result.execution_time_ms,
            result_count: result.count,
            parameters,
            timestamp: Utc::now(),
        },
    }))
}

/// `POST /data/execute-custom/{collection}`
#[instrument(skip(state, body))]
pub async fn execute_custom_query(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    timeout: ClientTimeout,
    body: Result<Json<CustomQueryRequest>, JsonRejection>,
) -> ApiResult<Json<ExecuteResponse<CustomQueryMetadata>>> {
    let Json(request) = body?;

    let timeout = timeout.effective(state.gateway.timeout());
    let outcome = state
        .gateway
        .execute_within(&collection, &request, timeout)
        .await?;

    Ok(Json(ExecuteResponse {
        success: true,
        data: outcome.result.data,
        metadata: CustomQueryMetadata {
            collection: outcome.collection,
            operation: outcome.operation,
            execution_time: outcome.result.execution_time_ms,
            result_count: outcome.result.count,
            options: outcome.options,
            timestamp: Utc::now(),
        },
    }))
}

/// `GET /data/stats`
///
/// All counts run concurrently; the first failure fails the request.
#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<DataResponse<StatsResponse>>> {
    let store = state.store.as_ref();
    let count = |collection: Collection| store.count_documents(collection.as_str(), json!({}));

    let (users, companies, job_seekers, employers, jobs, applications, active_jobs, active_companies) = tokio::try_join!(
        count(Collection::Users),
        count(Collection::Companies),
        count(Collection::JobSeekerProfiles),
        count(Collection::EmployerProfiles),
        count(Collection::Jobs),
        count(Collection::Applications),
        store.count_documents(Collection::Jobs.as_str(), json!({"status": "Active"})),
        store.count_documents(Collection::Companies.as_str(), json!({"isActive": true})),
    )?;

    let collections = BTreeMap::from([
        (Collection::Users.as_str().to_string(), users),
        (Collection::Companies.as_str().to_string(), companies),
        (Collection::JobSeekerProfiles.as_str().to_string(), job_seekers),
        (Collection::EmployerProfiles.as_str().to_string(), employers),
        (Collection::Jobs.as_str().to_string(), jobs),
        (Collection::Applications.as_str().to_string(), applications),
    ]);

    Ok(Json(DataResponse::ok(StatsResponse {
        collections,
        active_jobs,
        active_companies,
        timestamp: Utc::now(),
    })))
}
