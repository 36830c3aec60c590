use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::catalog::{Parameters, QueryCatalog, QueryDefinition, QueryParams};
use super::result::QueryResult;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::store::{DocumentStore, StoreError};

/// Runs catalog queries against a [`DocumentStore`].
#[derive(Clone)]
pub struct QueryExecutor {
    catalog: Arc<QueryCatalog>,
    store: Arc<dyn DocumentStore>,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(catalog: Arc<QueryCatalog>, store: Arc<dyn DocumentStore>, timeout: Duration) -> Self {
        Self {
            catalog,
            store,
            timeout,
        }
    }

    pub fn catalog(&self) -> &QueryCatalog {
        &self.catalog
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute `query_id` with `parameters` merged over its defaults.
    pub async fn execute(&self, query_id: &str, parameters: &Parameters) -> ApiResult<QueryResult> {
        self.execute_within(query_id, parameters, self.timeout).await
    }

    /// Like [`execute`](Self::execute) with an explicit per-call time limit.
    #[instrument(skip(self, parameters))]
    pub async fn execute_within(
        &self,
        query_id: &str,
        parameters: &Parameters,
        timeout: Duration,
    ) -> ApiResult<QueryResult> {
        let definition = self
            .catalog
            .get(query_id)
            .ok_or_else(|| ApiError::not_found(format!("Query '{query_id}' not found")))?;
        let params = definition.parameters(parameters);

        let start = Instant::now();
        let outcome = self.run(definition, &params, timeout).await;
        let elapsed = start.elapsed();
        metrics::record_query_duration("catalog", elapsed.as_secs_f64());

        match outcome {
            Ok(data) => {
                let result = QueryResult::new(data, elapsed);
                metrics::record_query(query_id, "success");
                debug!(count = result.count, ms = result.execution_time_ms, "Catalog query executed");
                Ok(result)
            }
            Err(e) => {
                metrics::record_query(query_id, e.kind());
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        definition: &QueryDefinition,
        params: &QueryParams,
        timeout: Duration,
    ) -> ApiResult<Value> {
        let collection = definition.collection;
        let primary = definition
            .build(params)?
            .run_within(self.store.as_ref(), collection, timeout)
            .await?;

        match primary {
            Err(StoreError::IndexNotFound { capability }) => {
                let Some(fallback) = definition.build_fallback(params) else {
                    return Err(StoreError::IndexNotFound { capability }.into());
                };
                warn!(
                    query = definition.id,
                    capability = capability.as_str(),
                    "Required index missing, using fallback query"
                );
                metrics::record_query_fallback(definition.id, capability.as_str());
                Ok(fallback?
                    .run_within(self.store.as_ref(), collection, timeout)
                    .await??)
            }
            other => Ok(other?),
        }
    }
}
