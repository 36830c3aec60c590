//! In-process document store.
//!
//! Collections are held as JSON documents behind a [`RwLock`]. Text search
//! and `$near` only work on collections that carry the matching index, which
//! is what lets the executor exercise its fallback paths against a store
//! that has not been provisioned yet.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::aggregate::{Pipeline, PipelineContext};
use super::document::{self, lookup, values_equal};
use super::filter::{Filter, MatchContext};
use super::{
    Capability, DocumentStore, FindQuery, IndexKind, IndexManager, IndexSpec, PopulateSpec,
    StoreError, StoreResult,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
    indexes: RwLock<Vec<IndexSpec>>,
}

/// A matched document with the values it sorts by.
struct Hit<'a> {
    doc: &'a Value,
    score: f64,
    distance: Option<f64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collections(collections: HashMap<String, Vec<Value>>) -> Self {
        Self {
            collections: RwLock::new(collections),
            indexes: RwLock::new(Vec::new()),
        }
    }

    /// Build from a seed document: `{"users": [...], "jobs": [...], ...}`.
    pub fn from_value(seed: Value) -> StoreResult<Self> {
        let Value::Object(map) = seed else {
            return Err(StoreError::invalid(
                "seed data must be an object of collection arrays",
            ));
        };

        let mut collections = HashMap::with_capacity(map.len());
        for (name, docs) in map {
            match docs {
                Value::Array(docs) => {
                    collections.insert(name, docs);
                }
                _ => {
                    return Err(StoreError::invalid(format!(
                        "seed collection '{name}' must be an array"
                    )));
                }
            }
        }
        Ok(Self::with_collections(collections))
    }

    /// Load a JSON seed file.
    pub async fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            StoreError::Internal(format!("failed to read seed file {}: {e}", path.display()))
        })?;
        let seed: Value = serde_json::from_str(&raw).map_err(|e| {
            StoreError::Internal(format!("invalid seed file {}: {e}", path.display()))
        })?;
        let store = Self::from_value(seed)?;
        info!(path = %path.display(), "Loaded seed data");
        Ok(store)
    }

    /// Append documents to a collection. Not reachable through [`DocumentStore`].
    pub async fn insert_many(&self, collection: &str, docs: Vec<Value>) {
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .extend(docs);
    }

    /// Document counts per collection.
    pub async fn collection_sizes(&self) -> HashMap<String, usize> {
        self.collections
            .read()
            .await
            .iter()
            .map(|(name, docs)| (name.clone(), docs.len()))
            .collect()
    }
}

fn text_fields(indexes: &[IndexSpec], collection: &str) -> Option<Vec<String>> {
    indexes.iter().find_map(|index| match &index.kind {
        IndexKind::Text { fields } if index.collection == collection => Some(fields.clone()),
        _ => None,
    })
}

fn has_geo_index(indexes: &[IndexSpec], collection: &str, path: &str) -> bool {
    indexes.iter().any(|index| {
        index.collection == collection
            && matches!(&index.kind, IndexKind::Geo2dSphere { field } if field == path)
    })
}

/// Text fields for `collection`, or the capability the filter is missing.
fn check_capabilities(
    indexes: &[IndexSpec],
    collection: &str,
    filter: &Filter,
) -> StoreResult<Vec<String>> {
    let fields = text_fields(indexes, collection);
    if filter.uses_text() && fields.is_none() {
        return Err(StoreError::IndexNotFound {
            capability: Capability::TextSearch,
        });
    }
    if filter
        .near_paths()
        .iter()
        .any(|path| !has_geo_index(indexes, collection, path))
    {
        return Err(StoreError::IndexNotFound {
            capability: Capability::Geospatial,
        });
    }
    Ok(fields.unwrap_or_default())
}

fn populate(doc: &mut Value, spec: &PopulateSpec, collections: &HashMap<String, Vec<Value>>) {
    let Some(reference) = lookup(doc, &spec.path).into_iter().next().cloned() else {
        return;
    };
    let targets = collections.get(&spec.from).map(Vec::as_slice).unwrap_or(&[]);
    let resolve = |id: &Value| {
        targets
            .iter()
            .find(|target| target.get("_id").is_some_and(|tid| values_equal(tid, id)))
            .map(|found| match &spec.select {
                Some(projection) => projection.apply(found),
                None => found.clone(),
            })
    };

    let populated = match &reference {
        Value::Array(ids) => Value::Array(ids.iter().filter_map(resolve).collect()),
        Value::Null => Value::Null,
        id => resolve(id).unwrap_or(Value::Null),
    };
    document::set_path(doc, &spec.path, populated);
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, collection: &str, query: FindQuery) -> StoreResult<Vec<Value>> {
        let filter = Filter::parse(&query.filter)?;
        let data = self.collections.read().await;
        let indexes = self.indexes.read().await;
        let fields = check_capabilities(&indexes, collection, &filter)?;
        drop(indexes);

        let ctx = MatchContext {
            text_fields: &fields,
        };
        let text = filter.text_search();
        let near = filter.near();
        let docs = data.get(collection).map(Vec::as_slice).unwrap_or(&[]);

        let mut hits: Vec<Hit<'_>> = docs
            .iter()
            .filter(|doc| filter.matches(doc, &ctx))
            .map(|doc| Hit {
                doc,
                score: text.map(|t| t.score(doc, &fields)).unwrap_or(0.0),
                distance: near.and_then(|(path, n)| n.distance(&lookup(doc, path))),
            })
            .collect();

        match &query.sort {
            Some(sort) if !sort.is_empty() => {
                hits.sort_by(|a, b| sort.compare(a.doc, b.doc, (a.score, b.score)));
            }
            _ if near.is_some() => hits.sort_by(|a, b| {
                a.distance
                    .unwrap_or(f64::INFINITY)
                    .total_cmp(&b.distance.unwrap_or(f64::INFINITY))
            }),
            _ => {}
        }

        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        let limit = query
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);

        let results: Vec<Value> = hits
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|hit| {
                let mut doc = match &query.projection {
                    Some(projection) => projection.apply(hit.doc),
                    None => hit.doc.clone(),
                };
                for spec in &query.populate {
                    populate(&mut doc, spec, &data);
                }
                doc
            })
            .collect();

        debug!(collection, returned = results.len(), "find");
        Ok(results)
    }

    async fn find_one(&self, collection: &str, query: FindQuery) -> StoreResult<Option<Value>> {
        let mut docs = self.find(collection, query.limit(1)).await?;
        Ok(docs.pop())
    }

    async fn aggregate(&self, collection: &str, pipeline: Vec<Value>) -> StoreResult<Vec<Value>> {
        let pipeline = Pipeline::parse(&pipeline)?;
        let data = self.collections.read().await;
        let fields = if pipeline.uses_text() {
            text_fields(&self.indexes.read().await, collection).ok_or(
                StoreError::IndexNotFound {
                    capability: Capability::TextSearch,
                },
            )?
        } else {
            Vec::new()
        };

        let ctx = PipelineContext {
            collections: &data,
            text_fields: &fields,
        };
        let input = data.get(collection).cloned().unwrap_or_default();
        let results = pipeline.run(input, &ctx)?;
        debug!(collection, returned = results.len(), "aggregate");
        Ok(results)
    }

    async fn count_documents(&self, collection: &str, filter: Value) -> StoreResult<u64> {
        let filter = Filter::parse(&filter)?;
        let data = self.collections.read().await;
        let fields = check_capabilities(&self.indexes.read().await, collection, &filter)?;
        let ctx = MatchContext {
            text_fields: &fields,
        };
        let count = data
            .get(collection)
            .map(|docs| docs.iter().filter(|doc| filter.matches(doc, &ctx)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }
}

#[async_trait]
impl IndexManager for MemoryStore {
    async fn ensure_indexes(&self, specs: &[IndexSpec]) -> StoreResult<Vec<IndexSpec>> {
        let mut indexes = self.indexes.write().await;
        let mut created = Vec::new();
        for spec in specs {
            let exists = indexes
                .iter()
                .any(|i| i.collection == spec.collection && i.name == spec.name);
            if !exists {
                indexes.push(spec.clone());
                created.push(spec.clone());
            }
        }
        Ok(created)
    }

    async fn drop_indexes(&self) -> StoreResult<usize> {
        let mut indexes = self.indexes.write().await;
        let dropped = indexes.len();
        indexes.clear();
        Ok(dropped)
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexSpec>> {
        Ok(self
            .indexes
            .read()
            .await
            .iter()
            .filter(|i| i.collection == collection)
            .cloned()
            .collect())
    }
}
