mod api;

pub use api::{
    CustomQueryMetadata, DataResponse, EnsureIndexesParams, ExecuteMetadata, ExecuteRequest,
    ExecuteResponse, HealthResponse, IndexReport, QueryListResponse, StatsResponse,
};
