use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::catalog::DefinitionSummary;
use crate::query::custom::AppliedOptions;
use crate::query::{Collection, Operation, Parameters};
use crate::store::IndexSpec;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"OK"` while the process serves requests.
    pub status: String,
    pub timestamp: DateTime<Utc>,
    /// Seconds since startup.
    pub uptime: f64,
    pub environment: String,
    pub version: String,
}

/// Generic `{success, data}` envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> DataResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// `GET /queries` response.
#[derive(Debug, Serialize)]
pub struct QueryListResponse {
    pub success: bool,
    pub data: Vec<DefinitionSummary>,
    pub count: usize,
}

/// Body of `POST /data/execute/{queryId}`.
#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub parameters: Parameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteMetadata {
    pub query_id: String,
    /// Milliseconds spent in the data store.
    pub execution_time: u64,
    pub result_count: u64,
    /// Caller parameters merged over the query's defaults.
    pub parameters: Parameters,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomQueryMetadata {
    pub collection: Collection,
    pub operation: Operation,
    pub execution_time: u64,
    pub result_count: u64,
    pub options: AppliedOptions,
    pub timestamp: DateTime<Utc>,
}

/// Query execution response: `{success, data, metadata}`.
#[derive(Debug, Serialize)]
pub struct ExecuteResponse<M> {
    pub success: bool,
    pub data: Value,
    pub metadata: M,
}

/// `GET /data/stats` payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    /// Document count per collection.
    pub collections: BTreeMap<String, u64>,
    pub active_jobs: u64,
    pub active_companies: u64,
    pub timestamp: DateTime<Utc>,
}

/// Query string of `POST /admin/ensure-indexes`.
#[derive(Debug, Default, Deserialize)]
pub struct EnsureIndexesParams {
    #[serde(default)]
    pub recreate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub dropped: usize,
    pub created: Vec<IndexSpec>,
    pub indexes: Vec<IndexSpec>,
}
