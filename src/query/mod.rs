//! Query execution: the catalog of named queries and the custom query gateway.
//!
//! Both paths end in a [`StoreOperation`], the only shape in which a request
//! can reach the data store. Its variants mirror the read methods of
//! [`DocumentStore`]; there is nothing to express a write with.

pub mod catalog;
pub mod custom;
pub mod executor;
pub mod result;

use std::time::Duration;

use serde_json::Value;

use crate::error::{ApiError, ApiResult};
use crate::store::{DocumentStore, FindQuery, StoreResult};

pub use catalog::{Parameters, QueryCatalog, QueryDefinition};
pub use custom::{Collection, CustomQueryGateway, CustomQueryRequest, Operation, QueryOptions};
pub use executor::QueryExecutor;
pub use result::QueryResult;

/// A read against one collection.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOperation {
    Find(FindQuery),
    FindOne(FindQuery),
    Aggregate(Vec<Value>),
    Count(Value),
}

impl StoreOperation {
    pub async fn run(self, store: &dyn DocumentStore, collection: &str) -> StoreResult<Value> {
        match self {
            StoreOperation::Find(query) => store.find(collection, query).await.map(Value::Array),
            StoreOperation::FindOne(query) => store
                .find_one(collection, query)
                .await
                .map(|doc| doc.unwrap_or(Value::Null)),
            StoreOperation::Aggregate(pipeline) => store
                .aggregate(collection, pipeline)
                .await
                .map(Value::Array),
            StoreOperation::Count(filter) => store
                .count_documents(collection, filter)
                .await
                .map(Value::from),
        }
    }

    /// Run with an upper bound on wall-clock time. The outer error is the
    /// timeout; the inner one is whatever the store reported.
    pub async fn run_within(
        self,
        store: &dyn DocumentStore,
        collection: &str,
        limit: Duration,
    ) -> ApiResult<StoreResult<Value>> {
        tokio::time::timeout(limit, self.run(store, collection))
            .await
            .map_err(|_| {
                ApiError::timeout(format!(
                    "Query exceeded the {} ms time limit",
                    limit.as_millis()
                ))
            })
    }
}
