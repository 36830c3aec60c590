//! Data store seam.
//!
//! The query layer only ever sees [`DocumentStore`], which has no write
//! methods at all. Index maintenance lives on the separate [`IndexManager`]
//! trait and is reachable only from startup and the admin endpoint.
//!
//! # Query Language
//!
//! Filters, projections, sorts and pipelines are JSON documents in the
//! familiar document-database dialect (`{"status": "Active", "salaryRange.min":
//! {"$gte": 15000}}`). See [`filter`] and [`aggregate`] for the supported
//! operators.

pub mod aggregate;
pub mod document;
pub mod filter;
pub mod indexes;
pub mod memory;

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use document::compare_values;
pub use indexes::{IndexKind, IndexSpec, standard_indexes};
pub use memory::MemoryStore;

/// Optional store capability backed by an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    TextSearch,
    Geospatial,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::TextSearch => "text",
            Capability::Geospatial => "2dsphere",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} index", self.as_str())
    }
}

/// Errors reported by a data store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The operation needs an index the collection does not have.
    #[error("required {capability} not found")]
    IndexNotFound { capability: Capability },

    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("data store failure: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidQuery {
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Direction of one sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
    /// Text relevance, highest first. Only meaningful with a `$text` filter.
    TextScore,
}

/// Ordered list of sort keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortSpec(pub Vec<(String, SortOrder)>);

impl SortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), SortOrder::Asc));
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), SortOrder::Desc));
        self
    }

    pub fn text_score(mut self, field: impl Into<String>) -> Self {
        self.0.push((field.into(), SortOrder::TextScore));
        self
    }

    /// Parse `{"field": 1 | -1 | "asc" | "desc" | {"$meta": "textScore"}}` or
    /// the space separated `"field -other"` form.
    pub fn from_value(value: &Value) -> StoreResult<Self> {
        match value {
            Value::Object(map) => {
                let mut keys = Vec::with_capacity(map.len());
                for (field, direction) in map {
                    keys.push((field.clone(), parse_direction(field, direction)?));
                }
                Ok(Self(keys))
            }
            Value::String(spec) => Ok(Self(
                spec.split_whitespace()
                    .map(|token| match token.strip_prefix('-') {
                        Some(field) => (field.to_string(), SortOrder::Desc),
                        None => (token.trim_start_matches('+').to_string(), SortOrder::Asc),
                    })
                    .collect(),
            )),
            other => Err(StoreError::invalid(format!(
                "sort must be an object or string, got {other}"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Order two documents. `scores` are their text relevance scores, used by
    /// [`SortOrder::TextScore`] keys.
    pub fn compare(&self, a: &Value, b: &Value, scores: (f64, f64)) -> Ordering {
        for (field, order) in &self.0 {
            let ord = match order {
                SortOrder::TextScore => scores.1.total_cmp(&scores.0),
                SortOrder::Asc => compare_values(sort_key(a, field), sort_key(b, field)),
                SortOrder::Desc => compare_values(sort_key(b, field), sort_key(a, field)),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

static NULL: Value = Value::Null;

fn sort_key<'a>(doc: &'a Value, field: &str) -> &'a Value {
    document::lookup(doc, field)
        .into_iter()
        .next()
        .unwrap_or(&NULL)
}

fn parse_direction(field: &str, direction: &Value) -> StoreResult<SortOrder> {
    match direction {
        Value::Number(n) if n.as_f64() == Some(1.0) => Ok(SortOrder::Asc),
        Value::Number(n) if n.as_f64() == Some(-1.0) => Ok(SortOrder::Desc),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            _ => Err(StoreError::invalid(format!(
                "invalid sort direction for '{field}'"
            ))),
        },
        Value::Object(meta) if meta.get("$meta") == Some(&Value::from("textScore")) => {
            Ok(SortOrder::TextScore)
        }
        _ => Err(StoreError::invalid(format!(
            "invalid sort direction for '{field}'"
        ))),
    }
}

/// Field selection applied to result documents.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep only these dotted paths (plus `_id` unless excluded).
    Include { fields: Vec<String>, keep_id: bool },
    /// Drop these dotted paths.
    Exclude(Vec<String>),
}

impl Projection {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Projection::Include {
            fields: fields.into_iter().map(Into::into).collect(),
            keep_id: true,
        }
    }

    /// Parse `{"a": 1, "b.c": 1}`, `{"secret": 0}` or the `"a b -c"` string form.
    pub fn from_value(value: &Value) -> StoreResult<Self> {
        let mut included = Vec::new();
        let mut excluded = Vec::new();
        let mut keep_id = true;

        match value {
            Value::Object(map) => {
                for (field, flag) in map {
                    let on = match flag {
                        Value::Bool(b) => *b,
                        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
                        _ => {
                            return Err(StoreError::invalid(format!(
                                "projection value for '{field}' must be 0/1 or a boolean"
                            )));
                        }
                    };
                    match (field.as_str(), on) {
                        ("_id", false) => keep_id = false,
                        ("_id", true) => {}
                        (_, true) => included.push(field.clone()),
                        (_, false) => excluded.push(field.clone()),
                    }
                }
            }
            Value::String(spec) => {
                for token in spec.split_whitespace() {
                    match token.strip_prefix('-') {
                        Some("_id") => keep_id = false,
                        Some(field) => excluded.push(field.to_string()),
                        None => included.push(token.trim_start_matches('+').to_string()),
                    }
                }
            }
            other => {
                return Err(StoreError::invalid(format!(
                    "select must be an object or string, got {other}"
                )));
            }
        }

        match (included.is_empty(), excluded.is_empty()) {
            (false, false) => Err(StoreError::invalid(
                "projection cannot mix inclusion and exclusion",
            )),
            (true, false) => {
                if !keep_id {
                    excluded.push("_id".to_string());
                }
                Ok(Projection::Exclude(excluded))
            }
            (false, true) => Ok(Projection::Include {
                fields: included,
                keep_id,
            }),
            (true, true) if !keep_id => Ok(Projection::Exclude(vec!["_id".to_string()])),
            (true, true) => Ok(Projection::Exclude(Vec::new())),
        }
    }

    /// Apply to one document.
    pub fn apply(&self, doc: &Value) -> Value {
        match self {
            Projection::Include { fields, keep_id } => {
                let mut out = Value::Object(serde_json::Map::new());
                if *keep_id && let Some(id) = doc.get("_id") {
                    document::set_path(&mut out, "_id", id.clone());
                }
                for field in fields {
                    if let Some(value) = document::project_path(doc, field) {
                        document::merge_into(&mut out, value);
                    }
                }
                out
            }
            Projection::Exclude(fields) => {
                let mut out = doc.clone();
                for field in fields {
                    document::remove_path(&mut out, field);
                }
                out
            }
        }
    }
}

/// Replace a reference field with the referenced document.
#[derive(Debug, Clone, PartialEq)]
pub struct PopulateSpec {
    /// Field holding the referenced `_id` (or array of ids).
    pub path: String,
    /// Collection the id points into.
    pub from: String,
    /// Fields kept on the populated document.
    pub select: Option<Projection>,
}

/// A `find` / `findOne` request.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub filter: Value,
    pub projection: Option<Projection>,
    pub sort: Option<SortSpec>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub populate: Vec<PopulateSpec>,
}

impl Default for FindQuery {
    fn default() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }
}

impl FindQuery {
    pub fn new(filter: Value) -> Self {
        Self {
            filter,
            projection: None,
            sort: None,
            skip: 0,
            limit: None,
            populate: Vec::new(),
        }
    }

    pub fn select(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn populate(mut self, spec: PopulateSpec) -> Self {
        self.populate.push(spec);
        self
    }
}

/// Read-only access to document collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, collection: &str, query: FindQuery) -> StoreResult<Vec<Value>>;

    async fn find_one(&self, collection: &str, query: FindQuery) -> StoreResult<Option<Value>>;

    async fn aggregate(&self, collection: &str, pipeline: Vec<Value>) -> StoreResult<Vec<Value>>;

    async fn count_documents(&self, collection: &str, filter: Value) -> StoreResult<u64>;
}

/// Index maintenance, kept apart from the read path.
#[async_trait]
pub trait IndexManager: Send + Sync {
    /// Create every index in `specs` that does not exist yet. Returns the ones created.
    async fn ensure_indexes(&self, specs: &[IndexSpec]) -> StoreResult<Vec<IndexSpec>>;

    /// Drop all indexes. Returns how many were removed.
    async fn drop_indexes(&self) -> StoreResult<usize>;

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<IndexSpec>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sort_from_object() {
        let sort = SortSpec::from_value(&json!({"postedDate": -1, "title": 1})).unwrap();
        assert_eq!(
            sort.0,
            vec![
                ("postedDate".to_string(), SortOrder::Desc),
                ("title".to_string(), SortOrder::Asc)
            ]
        );
    }

    #[test]
    fn test_sort_from_string_and_meta() {
        let sort = SortSpec::from_value(&json!("-createdAt name")).unwrap();
        assert_eq!(sort.0.first().unwrap().1, SortOrder::Desc);

        let sort = SortSpec::from_value(&json!({"score": {"$meta": "textScore"}})).unwrap();
        assert_eq!(sort.0.first().unwrap().1, SortOrder::TextScore);

        assert!(SortSpec::from_value(&json!({"a": 2})).is_err());
        assert!(SortSpec::from_value(&json!(5)).is_err());
    }

    #[test]
    fn test_projection_parse() {
        let p = Projection::from_value(&json!("companyName industry")).unwrap();
        assert_eq!(p, Projection::include(["companyName", "industry"]));

        let p = Projection::from_value(&json!({"password": 0})).unwrap();
        assert_eq!(p, Projection::Exclude(vec!["password".to_string()]));

        assert!(Projection::from_value(&json!({"a": 1, "b": 0})).is_err());
    }

    #[test]
    fn test_projection_apply_include_nested() {
        let doc = json!({"_id": "j1", "title": "Dev", "salaryRange": {"min": 1, "max": 2}, "x": 1});
        let out = Projection::include(["title", "salaryRange.max"]).apply(&doc);
        assert_eq!(out, json!({"_id": "j1", "title": "Dev", "salaryRange": {"max": 2}}));
    }

    #[test]
    fn test_projection_apply_exclude_id() {
        let doc = json!({"_id": "u1", "email": "a@b.c"});
        let p = Projection::from_value(&json!({"_id": 0, "email": 1})).unwrap();
        assert_eq!(p.apply(&doc), json!({"email": "a@b.c"}));
    }
}
