//! Ad-hoc read queries from clients.
//!
//! A request passes these checks in order, each failing fast:
//!
//! 1. the collection is one of [`Collection`] (400 otherwise)
//! 2. the operation is one of [`Operation`] (403 for a mutating verb, 400 otherwise)
//! 3. the query shape fits the operation: a pipeline array for `aggregate`,
//!    an object for everything else (400)
//! 4. the serialized query names no mutating verb or writing stage (403)
//! 5. options are parsed and `limit` is clamped to `[1, max_limit]`
//!
//! Only then is a [`StoreOperation`] built. Step 2 is the real guard since a
//! [`StoreOperation`] cannot express a write; step 4 is a textual second line.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use super::StoreOperation;
use super::result::QueryResult;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::store::{DocumentStore, FindQuery, PopulateSpec, Projection, SortSpec};

/// Collections open to custom queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Users,
    Companies,
    JobSeekerProfiles,
    EmployerProfiles,
    Jobs,
    Applications,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Users,
        Collection::Companies,
        Collection::JobSeekerProfiles,
        Collection::EmployerProfiles,
        Collection::Jobs,
        Collection::Applications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Companies => "companies",
            Collection::JobSeekerProfiles => "jobseekerprofiles",
            Collection::EmployerProfiles => "employerprofiles",
            Collection::Jobs => "jobs",
            Collection::Applications => "applications",
        }
    }

    /// Reference fields that `populate` may follow, with their target collection.
    pub fn references(&self) -> &'static [(&'static str, Collection)] {
        match self {
            Collection::Users => &[],
            Collection::Companies => &[],
            Collection::JobSeekerProfiles => &[("userId", Collection::Users)],
            Collection::EmployerProfiles => &[
                ("userId", Collection::Users),
                ("companyId", Collection::Companies),
            ],
            Collection::Jobs => &[
                ("companyId", Collection::Companies),
                ("postedBy", Collection::Users),
            ],
            Collection::Applications => &[
                ("jobId", Collection::Jobs),
                ("jobSeekerId", Collection::JobSeekerProfiles),
                ("companyId", Collection::Companies),
                ("statusHistory.changedBy", Collection::Users),
            ],
        }
    }

    fn supported() -> String {
        Self::ALL
            .iter()
            .map(Collection::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = ApiError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == lower)
            .ok_or_else(|| {
                ApiError::validation_with(
                    format!(
                        "Collection '{s}' is not supported. Supported collections: {}",
                        Self::supported()
                    ),
                    json!({"collection": s}),
                )
            })
    }
}

/// Read operations a custom query may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Find,
    FindOne,
    Aggregate,
    CountDocuments,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Find,
        Operation::FindOne,
        Operation::Aggregate,
        Operation::CountDocuments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Find => "find",
            Operation::FindOne => "findOne",
            Operation::Aggregate => "aggregate",
            Operation::CountDocuments => "countDocuments",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ApiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(op) = Self::ALL.into_iter().find(|op| op.as_str() == s) {
            return Ok(op);
        }
        if is_mutating_verb(s) {
            return Err(ApiError::forbidden(format!(
                "Operation '{s}' is not allowed. Only read operations are permitted"
            )));
        }
        let allowed: Vec<&str> = Self::ALL.iter().map(Operation::as_str).collect();
        Err(ApiError::validation_with(
            format!(
                "Operation '{s}' is not allowed. Allowed operations: {}",
                allowed.join(", ")
            ),
            json!({"operation": s, "allowed": allowed}),
        ))
    }
}

/// Multi-word verbs, matched anywhere in the serialized query.
const COMPOUND_VERBS: [&str; 14] = [
    "deleteOne",
    "deleteMany",
    "updateOne",
    "updateMany",
    "findOneAndUpdate",
    "findOneAndDelete",
    "findOneAndReplace",
    "replaceOne",
    "insertOne",
    "insertMany",
    "bulkWrite",
    "dropCollection",
    "dropDatabase",
    "renameCollection",
];

/// Single-word verbs, matched case-sensitively as whole tokens (optionally
/// `$`-prefixed), so prose such as "Save the Children" stays readable.
const WORD_VERBS: [&str; 4] = ["remove", "create", "save", "drop"];

/// Operators that write or run server-side code.
const FORBIDDEN_OPERATORS: [&str; 5] = ["$out", "$merge", "$where", "$function", "$accumulator"];

static WORD_VERB_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?:^|[^A-Za-z0-9_])\$?(?:{})(?:$|[^A-Za-z0-9_])",
        WORD_VERBS.join("|")
    ))
    .ok()
});

static OPERATOR_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    let names: Vec<String> = FORBIDDEN_OPERATORS
        .iter()
        .map(|op| regex::escape(op))
        .collect();
    Regex::new(&format!(r"(?:{})(?:$|[^A-Za-z0-9_])", names.join("|"))).ok()
});

fn is_mutating_verb(name: &str) -> bool {
    let lower = name.trim_start_matches('$').to_ascii_lowercase();
    COMPOUND_VERBS.iter().any(|v| v.to_ascii_lowercase() == lower)
        || WORD_VERBS.contains(&lower.as_str())
}

/// First mutating verb or writing operator found in `text`.
pub fn find_forbidden(text: &str) -> Option<String> {
    let lower = text.to_ascii_lowercase();
    if let Some(verb) = COMPOUND_VERBS
        .iter()
        .find(|v| lower.contains(&v.to_ascii_lowercase()))
    {
        return Some((*verb).to_string());
    }
    for pattern in [&*WORD_VERB_PATTERN, &*OPERATOR_PATTERN] {
        match pattern {
            Some(re) => {
                if let Some(found) = re.find(text) {
                    let token = found
                        .as_str()
                        .trim_matches(|c: char| !(c.is_ascii_alphanumeric() || c == '$' || c == '_'));
                    return Some(token.to_string());
                }
            }
            // An unbuildable pattern must not open the gate.
            None => return Some("<unverifiable>".to_string()),
        }
    }
    None
}

/// Validated query body.
#[derive(Debug, Clone, PartialEq)]
pub enum CustomQuery {
    Filter(Map<String, Value>),
    Pipeline(Vec<Value>),
}

/// Caller options, as received.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub populate: Option<Value>,
}

/// Request body of the custom query endpoint.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomQueryRequest {
    #[serde(default)]
    pub query: Value,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub options: Option<QueryOptions>,
}

/// Options after sanitization, echoed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Value>,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub populate: Option<Value>,
}

/// Default and maximum `limit` for custom queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomQueryLimits {
    pub default_limit: u64,
    pub max_limit: u64,
}

impl Default for CustomQueryLimits {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
        }
    }
}

impl CustomQueryLimits {
    /// Absent or non-positive limits become the default; the result never exceeds the max.
    pub fn clamp(&self, requested: Option<i64>) -> u64 {
        let limit = match requested {
            Some(n) if n > 0 => u64::try_from(n).unwrap_or(u64::MAX),
            _ => self.default_limit,
        };
        limit.clamp(1, self.max_limit.max(1))
    }
}

/// A request that passed every check, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedQuery {
    pub collection: Collection,
    pub operation: Operation,
    pub query: CustomQuery,
    pub options: AppliedOptions,
}

impl ValidatedQuery {
    /// Translate into the store call. Option parse errors surface here.
    pub fn to_store_operation(&self) -> ApiResult<StoreOperation> {
        match &self.query {
            CustomQuery::Pipeline(stages) => {
                let mut stages = stages.clone();
                stages.push(json!({"$limit": self.options.limit}));
                Ok(StoreOperation::Aggregate(stages))
            }
            CustomQuery::Filter(filter) => {
                let filter = Value::Object(filter.clone());
                match self.operation {
                    Operation::CountDocuments => Ok(StoreOperation::Count(filter)),
                    Operation::FindOne => Ok(StoreOperation::FindOne(self.find_query(filter)?)),
                    Operation::Find | Operation::Aggregate => {
                        Ok(StoreOperation::Find(self.find_query(filter)?))
                    }
                }
            }
        }
    }

    fn find_query(&self, filter: Value) -> ApiResult<FindQuery> {
        let options = &self.options;
        let mut query = FindQuery::new(filter).limit(options.limit);
        if let Some(select) = &options.select {
            query = query.select(Projection::from_value(select).map_err(option_error("select"))?);
        }
        if let Some(sort) = &options.sort {
            query = query.sort(SortSpec::from_value(sort).map_err(option_error("sort"))?);
        }
        if let Some(skip) = options.skip {
            query = query.skip(skip);
        }
        if let Some(populate) = &options.populate {
            for spec in parse_populate(self.collection, populate)? {
                query = query.populate(spec);
            }
        }
        Ok(query)
    }
}

fn option_error<E: fmt::Display>(option: &'static str) -> impl Fn(E) -> ApiError {
    move |e| {
        ApiError::validation_with(
            format!("Invalid '{option}' option"),
            json!({ option: e.to_string() }),
        )
    }
}

/// Accepts `"companyId postedBy"`, `{"path": "companyId", "select": "companyName"}`
/// or an array of either.
fn parse_populate(collection: Collection, value: &Value) -> ApiResult<Vec<PopulateSpec>> {
    let invalid = |message: String| ApiError::validation_with(message, json!({"populate": value}));
    let spec_for = |path: &str, select: Option<&Value>| -> ApiResult<PopulateSpec> {
        let (_, target) = collection
            .references()
            .iter()
            .find(|(field, _)| *field == path)
            .ok_or_else(|| invalid(format!("Cannot populate '{path}' on {collection}")))?;
        let select = select
            .map(Projection::from_value)
            .transpose()
            .map_err(option_error("populate"))?;
        Ok(PopulateSpec {
            path: path.to_string(),
            from: target.as_str().to_string(),
            select,
        })
    };

    match value {
        Value::String(paths) => paths.split_whitespace().map(|p| spec_for(p, None)).collect(),
        Value::Object(map) => {
            let path = map
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("populate object requires a 'path'".to_string()))?;
            Ok(vec![spec_for(path, map.get("select"))?])
        }
        Value::Array(items) => {
            let mut specs = Vec::with_capacity(items.len());
            for item in items {
                specs.extend(parse_populate(collection, item)?);
            }
            Ok(specs)
        }
        _ => Err(invalid(
            "populate must be a string, an object or an array".to_string(),
        )),
    }
}

/// Run checks 1 through 5 for a request against `collection`.
pub fn validate_request(
    collection: &str,
    request: &CustomQueryRequest,
    limits: &CustomQueryLimits,
) -> ApiResult<ValidatedQuery> {
    let collection: Collection = collection.parse()?;
    let operation: Operation = request.operation.as_deref().unwrap_or("find").parse()?;

    let query = match (operation, &request.query) {
        (Operation::Aggregate, Value::Array(stages)) => CustomQuery::Pipeline(stages.clone()),
        (Operation::Aggregate, _) => {
            return Err(ApiError::validation(
                "Aggregation query must be an array of pipeline stages",
            ));
        }
        (_, Value::Object(filter)) => CustomQuery::Filter(filter.clone()),
        (_, _) => {
            return Err(ApiError::validation(
                "Query must be a valid query object",
            ));
        }
    };

    let serialized = serde_json::to_string(&request.query)
        .map_err(|e| ApiError::internal(format!("failed to serialize query: {e}")))?;
    if let Some(verb) = find_forbidden(&serialized) {
        warn!(%collection, %operation, verb = %verb, "Rejected custom query naming a mutating operation");
        return Err(ApiError::forbidden("Only read operations are allowed"));
    }

    let options = request.options.clone().unwrap_or_default();
    Ok(ValidatedQuery {
        collection,
        operation,
        query,
        options: AppliedOptions {
            limit: limits.clamp(options.limit),
            select: options.select,
            sort: options.sort,
            skip: options.skip,
            populate: options.populate,
        },
    })
}

/// Outcome of a custom query, with what was actually run.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomQueryOutcome {
    pub collection: Collection,
    pub operation: Operation,
    pub options: AppliedOptions,
    pub result: QueryResult,
}

/// Validates and runs custom queries.
#[derive(Clone)]
pub struct CustomQueryGateway {
    store: Arc<dyn DocumentStore>,
    limits: CustomQueryLimits,
    timeout: Duration,
}

impl CustomQueryGateway {
    pub fn new(store: Arc<dyn DocumentStore>, limits: CustomQueryLimits, timeout: Duration) -> Self {
        Self {
            store,
            limits,
            timeout,
        }
    }

    pub fn limits(&self) -> CustomQueryLimits {
        self.limits
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn execute(
        &self,
        collection: &str,
        request: &CustomQueryRequest,
    ) -> ApiResult<CustomQueryOutcome> {
        self.execute_within(collection, request, self.timeout).await
    }

    #[instrument(skip(self, request), fields(operation = request.operation.as_deref().unwrap_or("find")))]
    pub async fn execute_within(
        &self,
        collection: &str,
        request: &CustomQueryRequest,
        timeout: Duration,
    ) -> ApiResult<CustomQueryOutcome> {
        let validated = match validate_request(collection, request, &self.limits) {
            Ok(validated) => validated,
            Err(e) => {
                let operation = request.operation.as_deref().unwrap_or("find");
                let known_collection = collection.parse::<Collection>().map(|c| c.as_str());
                let known_operation = operation.parse::<Operation>().map(|o| o.as_str());
                metrics::record_custom_query(
                    known_collection.unwrap_or("unknown"),
                    known_operation.unwrap_or("unknown"),
                    e.kind(),
                );
                return Err(e);
            }
        };

        let labels = (validated.collection.as_str(), validated.operation.as_str());
        match self.run(&validated, timeout).await {
            Ok(result) => {
                metrics::record_custom_query(labels.0, labels.1, "success");
                debug!(count = result.count, ms = result.execution_time_ms, "Custom query executed");
                Ok(CustomQueryOutcome {
                    collection: validated.collection,
                    operation: validated.operation,
                    options: validated.options,
                    result,
                })
            }
            Err(e) => {
                metrics::record_custom_query(labels.0, labels.1, e.kind());
                Err(e)
            }
        }
    }

    /// Step 6: build the store call and time it.
    pub async fn run(&self, validated: &ValidatedQuery, timeout: Duration) -> ApiResult<QueryResult> {
        let operation = validated.to_store_operation()?;
        let start = Instant::now();
        let data = operation
            .run_within(self.store.as_ref(), validated.collection.as_str(), timeout)
            .await??;
        let elapsed = start.elapsed();
        metrics::record_query_duration("custom", elapsed.as_secs_f64());
        Ok(QueryResult::new(data, elapsed))
    }
}
