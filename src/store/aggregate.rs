//! Aggregation pipelines.
//!
//! Stages: `$match $project $addFields $group $sort $limit $skip $unwind
//! $lookup $count`. Every other stage is rejected, which includes the
//! writing stages `$out` and `$merge`.
//!
//! Expressions support field paths (`"$salaryRange.min"`), variables
//! (`"$$this.status"`, `"$$ROOT"`), `$literal` and the operators `$size
//! $filter $eq $ne $gt $gte $lt $lte $and $or $not $ifNull $concat $month
//! $year $dayOfMonth`.

use std::collections::HashMap;

use chrono::Datelike;
use serde_json::{Map, Number, Value};

use super::document::{self, compare_values, lookup, values_equal};
use super::filter::{Filter, MatchContext};
use super::{SortSpec, StoreError, StoreResult};

/// Collections visible to `$lookup`, plus text index fields for `$text`.
#[derive(Debug, Clone, Copy)]
pub struct PipelineContext<'a> {
    pub collections: &'a HashMap<String, Vec<Value>>,
    pub text_fields: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Accumulator {
    Sum,
    Avg,
    Min,
    Max,
    Push,
    AddToSet,
    First,
    Last,
}

impl Accumulator {
    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "$sum" => Self::Sum,
            "$avg" => Self::Avg,
            "$min" => Self::Min,
            "$max" => Self::Max,
            "$push" => Self::Push,
            "$addToSet" => Self::AddToSet,
            "$first" => Self::First,
            "$last" => Self::Last,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
enum Stage {
    Match(Filter),
    Project {
        include: Vec<String>,
        exclude: Vec<String>,
        computed: Vec<(String, Value)>,
        keep_id: bool,
    },
    AddFields(Vec<(String, Value)>),
    Group {
        id: Value,
        accumulators: Vec<(String, Accumulator, Value)>,
    },
    Sort(SortSpec),
    Limit(usize),
    Skip(usize),
    Unwind {
        path: String,
        preserve_empty: bool,
    },
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        as_field: String,
    },
    Count(String),
}

/// A validated pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn parse(stages: &[Value]) -> StoreResult<Self> {
        let mut parsed = Vec::with_capacity(stages.len());
        for (index, raw) in stages.iter().enumerate() {
            let stage = parse_stage(raw)?;
            if let Stage::Match(filter) = &stage {
                if filter.uses_text() && index != 0 {
                    return Err(StoreError::invalid(
                        "'$match' with '$text' must be the first stage",
                    ));
                }
                if !filter.near_paths().is_empty() {
                    return Err(StoreError::invalid("'$near' is not allowed in '$match'"));
                }
            }
            parsed.push(stage);
        }
        Ok(Self { stages: parsed })
    }

    /// Whether the pipeline starts with a `$text` match.
    pub fn uses_text(&self) -> bool {
        matches!(self.stages.first(), Some(Stage::Match(f)) if f.uses_text())
    }

    pub fn run(&self, mut docs: Vec<Value>, ctx: &PipelineContext<'_>) -> StoreResult<Vec<Value>> {
        for stage in &self.stages {
            docs = run_stage(stage, docs, ctx)?;
        }
        Ok(docs)
    }
}

fn single_key(raw: &Value) -> StoreResult<(&str, &Value)> {
    match raw.as_object() {
        Some(map) if map.len() == 1 => map
            .iter()
            .next()
            .map(|(k, v)| (k.as_str(), v))
            .ok_or_else(|| StoreError::invalid("empty pipeline stage")),
        _ => Err(StoreError::invalid(
            "each pipeline stage must be an object with exactly one operator",
        )),
    }
}

fn parse_stage(raw: &Value) -> StoreResult<Stage> {
    let (name, spec) = single_key(raw)?;
    match name {
        "$match" => Ok(Stage::Match(Filter::parse(spec)?)),
        "$project" => parse_project(spec),
        "$addFields" | "$set" => Ok(Stage::AddFields(object_entries(name, spec)?)),
        "$group" => parse_group(spec),
        "$sort" => Ok(Stage::Sort(SortSpec::from_value(spec)?)),
        "$limit" => match spec.as_u64().and_then(|n| usize::try_from(n).ok()) {
            Some(n) if n > 0 => Ok(Stage::Limit(n)),
            _ => Err(StoreError::invalid("'$limit' expects a positive integer")),
        },
        "$skip" => spec
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .map(Stage::Skip)
            .ok_or_else(|| StoreError::invalid("'$skip' expects a non-negative integer")),
        "$unwind" => parse_unwind(spec),
        "$lookup" => parse_lookup(spec),
        "$count" => match spec.as_str() {
            Some(field) if !field.is_empty() && !field.starts_with('$') => {
                Ok(Stage::Count(field.to_string()))
            }
            _ => Err(StoreError::invalid("'$count' expects a field name")),
        },
        other => Err(StoreError::invalid(format!(
            "unsupported pipeline stage '{other}'"
        ))),
    }
}

fn object_entries(stage: &str, spec: &Value) -> StoreResult<Vec<(String, Value)>> {
    spec.as_object()
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .ok_or_else(|| StoreError::invalid(format!("'{stage}' expects an object")))
}

fn parse_project(spec: &Value) -> StoreResult<Stage> {
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut computed = Vec::new();
    let mut keep_id = true;

    for (field, value) in object_entries("$project", spec)? {
        let flag = match &value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => Some(n.as_f64().is_some_and(|v| v != 0.0)),
            _ => None,
        };
        match (field.as_str(), flag) {
            ("_id", Some(false)) => keep_id = false,
            ("_id", Some(true)) => {}
            (_, Some(true)) => include.push(field),
            (_, Some(false)) => exclude.push(field),
            (_, None) => computed.push((field, value)),
        }
    }

    if !exclude.is_empty() && (!include.is_empty() || !computed.is_empty()) {
        return Err(StoreError::invalid(
            "'$project' cannot mix inclusion and exclusion",
        ));
    }
    Ok(Stage::Project {
        include,
        exclude,
        computed,
        keep_id,
    })
}

fn parse_group(spec: &Value) -> StoreResult<Stage> {
    let map = spec
        .as_object()
        .ok_or_else(|| StoreError::invalid("'$group' expects an object"))?;
    let id = map
        .get("_id")
        .cloned()
        .ok_or_else(|| StoreError::invalid("'$group' requires an '_id'"))?;

    let mut accumulators = Vec::new();
    for (field, acc) in map.iter().filter(|(k, _)| k.as_str() != "_id") {
        let (op, arg) = single_key(acc)?;
        let accumulator = Accumulator::parse(op).ok_or_else(|| {
            StoreError::invalid(format!("unsupported accumulator '{op}' for '{field}'"))
        })?;
        accumulators.push((field.clone(), accumulator, arg.clone()));
    }
    Ok(Stage::Group { id, accumulators })
}

fn parse_unwind(spec: &Value) -> StoreResult<Stage> {
    let (path, preserve_empty) = match spec {
        Value::String(path) => (path.as_str(), false),
        Value::Object(map) => (
            map.get("path").and_then(Value::as_str).unwrap_or(""),
            map.get("preserveNullAndEmptyArrays")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        ),
        _ => ("", false),
    };
    match path.strip_prefix('$') {
        Some(field) if !field.is_empty() => Ok(Stage::Unwind {
            path: field.to_string(),
            preserve_empty,
        }),
        _ => Err(StoreError::invalid("'$unwind' expects a '$field' path")),
    }
}

fn parse_lookup(spec: &Value) -> StoreResult<Stage> {
    let field = |name: &str| {
        spec.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::invalid(format!("'$lookup' requires '{name}'")))
    };
    Ok(Stage::Lookup {
        from: field("from")?,
        local_field: field("localField")?,
        foreign_field: field("foreignField")?,
        as_field: field("as")?,
    })
}

fn run_stage(stage: &Stage, docs: Vec<Value>, ctx: &PipelineContext<'_>) -> StoreResult<Vec<Value>> {
    match stage {
        Stage::Match(filter) => {
            let match_ctx = MatchContext {
                text_fields: ctx.text_fields,
            };
            Ok(docs
                .into_iter()
                .filter(|doc| filter.matches(doc, &match_ctx))
                .collect())
        }
        Stage::Project {
            include,
            exclude,
            computed,
            keep_id,
        } => docs
            .iter()
            .map(|doc| project(doc, include, exclude, computed, *keep_id))
            .collect(),
        Stage::AddFields(fields) => docs
            .into_iter()
            .map(|mut doc| {
                for (field, expr) in fields {
                    let value = evaluate(expr, &doc, &[])?;
                    document::set_path(&mut doc, field, value);
                }
                Ok(doc)
            })
            .collect(),
        Stage::Group { id, accumulators } => group(&docs, id, accumulators),
        Stage::Sort(spec) => {
            let mut docs = docs;
            docs.sort_by(|a, b| spec.compare(a, b, (0.0, 0.0)));
            Ok(docs)
        }
        Stage::Limit(n) => Ok(docs.into_iter().take(*n).collect()),
        Stage::Skip(n) => Ok(docs.into_iter().skip(*n).collect()),
        Stage::Unwind {
            path,
            preserve_empty,
        } => Ok(unwind(docs, path, *preserve_empty)),
        Stage::Lookup {
            from,
            local_field,
            foreign_field,
            as_field,
        } => {
            let foreign = ctx.collections.get(from).map(Vec::as_slice).unwrap_or(&[]);
            Ok(docs
                .into_iter()
                .map(|mut doc| {
                    let joined = join(&doc, local_field, foreign, foreign_field);
                    document::set_path(&mut doc, as_field, Value::Array(joined));
                    doc
                })
                .collect())
        }
        Stage::Count(field) => {
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Map::new();
            out.insert(field.clone(), Value::from(docs.len()));
            Ok(vec![Value::Object(out)])
        }
    }
}

fn project(
    doc: &Value,
    include: &[String],
    exclude: &[String],
    computed: &[(String, Value)],
    keep_id: bool,
) -> StoreResult<Value> {
    if include.is_empty() && computed.is_empty() {
        let mut out = doc.clone();
        for field in exclude {
            document::remove_path(&mut out, field);
        }
        if !keep_id {
            document::remove_path(&mut out, "_id");
        }
        return Ok(out);
    }

    let mut out = Value::Object(Map::new());
    if keep_id && let Some(id) = doc.get("_id") {
        document::set_path(&mut out, "_id", id.clone());
    }
    for field in include {
        if let Some(value) = document::project_path(doc, field) {
            document::merge_into(&mut out, value);
        }
    }
    for (field, expr) in computed {
        document::set_path(&mut out, field, evaluate(expr, doc, &[])?);
    }
    Ok(out)
}

fn unwind(docs: Vec<Value>, path: &str, preserve_empty: bool) -> Vec<Value> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match document::resolve(&doc, path) {
            Some(Value::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut copy = doc.clone();
                    document::set_path(&mut copy, path, item);
                    out.push(copy);
                }
            }
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                if preserve_empty {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    out
}

fn join(doc: &Value, local_field: &str, foreign: &[Value], foreign_field: &str) -> Vec<Value> {
    let mut locals: Vec<&Value> = Vec::new();
    for value in lookup(doc, local_field) {
        match value {
            Value::Array(items) => locals.extend(items.iter()),
            other => locals.push(other),
        }
    }

    foreign
        .iter()
        .filter(|candidate| {
            let keys = lookup(candidate, foreign_field);
            if locals.is_empty() {
                return keys.iter().all(|k| k.is_null());
            }
            keys.iter().any(|key| {
                let key_values: Vec<&Value> = match key {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![*other],
                };
                key_values
                    .iter()
                    .any(|k| locals.iter().any(|l| values_equal(k, l)))
            })
        })
        .cloned()
        .collect()
}

enum AccState {
    Sum { total: f64, int_total: i64, all_int: bool },
    Avg { total: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Push(Vec<Value>),
    AddToSet(Vec<Value>),
    First(Option<Value>),
    Last(Option<Value>),
}

impl AccState {
    fn new(acc: Accumulator) -> Self {
        match acc {
            Accumulator::Sum => AccState::Sum {
                total: 0.0,
                int_total: 0,
                all_int: true,
            },
            Accumulator::Avg => AccState::Avg {
                total: 0.0,
                count: 0,
            },
            Accumulator::Min => AccState::Min(None),
            Accumulator::Max => AccState::Max(None),
            Accumulator::Push => AccState::Push(Vec::new()),
            Accumulator::AddToSet => AccState::AddToSet(Vec::new()),
            Accumulator::First => AccState::First(None),
            Accumulator::Last => AccState::Last(None),
        }
    }

    fn add(&mut self, value: Value) {
        match self {
            AccState::Sum {
                total,
                int_total,
                all_int,
            } => {
                if let Value::Number(n) = &value {
                    match n.as_i64() {
                        Some(i) if *all_int => *int_total = int_total.saturating_add(i),
                        _ => *all_int = false,
                    }
                    *total += n.as_f64().unwrap_or(0.0);
                }
            }
            AccState::Avg { total, count } => {
                if let Some(v) = value.as_f64() {
                    *total += v;
                    *count += 1;
                }
            }
            AccState::Min(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .is_none_or(|c| compare_values(&value, c).is_lt())
                {
                    *current = Some(value);
                }
            }
            AccState::Max(current) => {
                if !value.is_null()
                    && current
                        .as_ref()
                        .is_none_or(|c| compare_values(&value, c).is_gt())
                {
                    *current = Some(value);
                }
            }
            AccState::Push(items) => items.push(value),
            AccState::AddToSet(items) => {
                if !items.iter().any(|i| values_equal(i, &value)) {
                    items.push(value);
                }
            }
            AccState::First(current) => {
                if current.is_none() {
                    *current = Some(value);
                }
            }
            AccState::Last(current) => *current = Some(value),
        }
    }

    fn finish(self) -> Value {
        match self {
            AccState::Sum {
                total,
                int_total,
                all_int,
            } => {
                if all_int {
                    Value::from(int_total)
                } else {
                    float(total)
                }
            }
            AccState::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    float(total / count as f64)
                }
            }
            AccState::Min(v) | AccState::Max(v) | AccState::First(v) | AccState::Last(v) => {
                v.unwrap_or(Value::Null)
            }
            AccState::Push(items) | AccState::AddToSet(items) => Value::Array(items),
        }
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn group(
    docs: &[Value],
    id: &Value,
    accumulators: &[(String, Accumulator, Value)],
) -> StoreResult<Vec<Value>> {
    let mut order: Vec<(Value, Vec<AccState>)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for doc in docs {
        let key = evaluate(id, doc, &[])?;
        let slot = key.to_string();
        let index = match positions.get(&slot) {
            Some(index) => *index,
            None => {
                let states = accumulators
                    .iter()
                    .map(|(_, acc, _)| AccState::new(*acc))
                    .collect();
                order.push((key, states));
                positions.insert(slot, order.len() - 1);
                order.len() - 1
            }
        };
        let Some((_, states)) = order.get_mut(index) else {
            continue;
        };
        for ((_, _, arg), state) in accumulators.iter().zip(states.iter_mut()) {
            state.add(evaluate(arg, doc, &[])?);
        }
    }

    Ok(order
        .into_iter()
        .map(|(key, states)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), key);
            for ((field, _, _), state) in accumulators.iter().zip(states) {
                out.insert(field.clone(), state.finish());
            }
            Value::Object(out)
        })
        .collect())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => true,
    }
}

/// Operator arguments may be given bare or as a one-element array.
fn unary_arg(arg: &Value) -> &Value {
    match arg {
        Value::Array(items) if items.len() == 1 => items.first().unwrap_or(arg),
        other => other,
    }
}

fn binary_args<'a>(op: &str, arg: &'a Value) -> StoreResult<(&'a Value, &'a Value)> {
    match arg.as_array().map(Vec::as_slice) {
        Some([a, b]) => Ok((a, b)),
        _ => Err(StoreError::invalid(format!("'{op}' expects two arguments"))),
    }
}

/// Evaluate an aggregation expression against `doc`.
///
/// `vars` holds `$$name` bindings, innermost last.
pub fn evaluate(expr: &Value, doc: &Value, vars: &[(&str, &Value)]) -> StoreResult<Value> {
    match expr {
        Value::String(s) if s.starts_with("$$") => {
            let reference = s.get(2..).unwrap_or_default();
            let (name, rest) = match reference.split_once('.') {
                Some((name, rest)) => (name, Some(rest)),
                None => (reference, None),
            };
            let base = match name {
                "ROOT" | "CURRENT" => doc,
                _ => vars
                    .iter()
                    .rev()
                    .find(|(bound, _)| *bound == name)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| StoreError::invalid(format!("undefined variable '$${name}'")))?,
            };
            Ok(match rest {
                Some(path) => document::resolve(base, path).unwrap_or(Value::Null),
                None => base.clone(),
            })
        }
        Value::String(s) if s.starts_with('$') => Ok(s
            .get(1..)
            .and_then(|path| document::resolve(doc, path))
            .unwrap_or(Value::Null)),
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate(item, doc, vars))
            .collect::<StoreResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => match map.iter().next() {
            Some((op, arg)) if map.len() == 1 && op.starts_with('$') => {
                evaluate_operator(op, arg, doc, vars)
            }
            _ => {
                let mut out = Map::new();
                for (key, value) in map {
                    out.insert(key.clone(), evaluate(value, doc, vars)?);
                }
                Ok(Value::Object(out))
            }
        },
        literal => Ok(literal.clone()),
    }
}

fn evaluate_operator(
    op: &str,
    arg: &Value,
    doc: &Value,
    vars: &[(&str, &Value)],
) -> StoreResult<Value> {
    match op {
        "$literal" => Ok(arg.clone()),
        "$size" => match evaluate(unary_arg(arg), doc, vars)? {
            Value::Array(items) => Ok(Value::from(items.len())),
            _ => Err(StoreError::invalid("'$size' requires an array")),
        },
        "$filter" => {
            let input = arg
                .get("input")
                .ok_or_else(|| StoreError::invalid("'$filter' requires 'input'"))?;
            let cond = arg
                .get("cond")
                .ok_or_else(|| StoreError::invalid("'$filter' requires 'cond'"))?;
            let name = arg.get("as").and_then(Value::as_str).unwrap_or("this");
            let items = match evaluate(input, doc, vars)? {
                Value::Array(items) => items,
                Value::Null => return Ok(Value::Null),
                _ => return Err(StoreError::invalid("'$filter' input must be an array")),
            };
            let mut kept = Vec::new();
            for item in items {
                let keep = {
                    let mut scoped = vars.to_vec();
                    scoped.push((name, &item));
                    truthy(&evaluate(cond, doc, &scoped)?)
                };
                if keep {
                    kept.push(item);
                }
            }
            Ok(Value::Array(kept))
        }
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            let (a, b) = binary_args(op, arg)?;
            let ord = compare_values(&evaluate(a, doc, vars)?, &evaluate(b, doc, vars)?);
            Ok(Value::Bool(match op {
                "$eq" => ord.is_eq(),
                "$ne" => ord.is_ne(),
                "$gt" => ord.is_gt(),
                "$gte" => ord.is_ge(),
                "$lt" => ord.is_lt(),
                _ => ord.is_le(),
            }))
        }
        "$and" | "$or" => {
            let items = arg
                .as_array()
                .ok_or_else(|| StoreError::invalid(format!("'{op}' expects an array")))?;
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(truthy(&evaluate(item, doc, vars)?));
            }
            Ok(Value::Bool(if op == "$and" {
                values.iter().all(|v| *v)
            } else {
                values.iter().any(|v| *v)
            }))
        }
        "$not" => Ok(Value::Bool(!truthy(&evaluate(unary_arg(arg), doc, vars)?))),
        "$ifNull" => {
            let (a, b) = binary_args(op, arg)?;
            match evaluate(a, doc, vars)? {
                Value::Null => evaluate(b, doc, vars),
                value => Ok(value),
            }
        }
        "$concat" => {
            let items = arg
                .as_array()
                .ok_or_else(|| StoreError::invalid("'$concat' expects an array"))?;
            let mut out = String::new();
            for item in items {
                match evaluate(item, doc, vars)? {
                    Value::String(s) => out.push_str(&s),
                    Value::Null => return Ok(Value::Null),
                    _ => return Err(StoreError::invalid("'$concat' only accepts strings")),
                }
            }
            Ok(Value::String(out))
        }
        "$month" | "$year" | "$dayOfMonth" => {
            let value = evaluate(unary_arg(arg), doc, vars)?;
            Ok(match document::as_datetime(&value) {
                Some(dt) => Value::from(match op {
                    "$month" => i64::from(dt.month()),
                    "$year" => i64::from(dt.year()),
                    _ => i64::from(dt.day()),
                }),
                None => Value::Null,
            })
        }
        other => Err(StoreError::invalid(format!(
            "unsupported expression operator '{other}'"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(pipeline: Value, docs: Vec<Value>, collections: &HashMap<String, Vec<Value>>) -> Vec<Value> {
        let stages = pipeline.as_array().unwrap().clone();
        let ctx = PipelineContext {
            collections,
            text_fields: &[],
        };
        Pipeline::parse(&stages).unwrap().run(docs, &ctx).unwrap()
    }

    #[test]
    fn test_group_sort_limit() {
        let docs = vec![
            json!({"industry": "Tech", "employeeCount": 100, "averageRating": 4.0}),
            json!({"industry": "Tech", "employeeCount": 300, "averageRating": 5.0}),
            json!({"industry": "Finance", "employeeCount": 50, "averageRating": 3.0}),
        ];
        let out = run(
            json!([
                {"$group": {"_id": "$industry", "companyCount": {"$sum": 1}, "avgEmployeeCount": {"$avg": "$employeeCount"}}},
                {"$sort": {"companyCount": -1}},
                {"$limit": 1}
            ]),
            docs,
            &HashMap::new(),
        );
        assert_eq!(out, vec![json!({"_id": "Tech", "companyCount": 2, "avgEmployeeCount": 200.0})]);
    }

    #[test]
    fn test_group_by_month_and_year() {
        let docs = vec![
            json!({"status": "Applied", "appliedAt": "2024-03-01T10:00:00Z"}),
            json!({"status": "Applied", "appliedAt": "2024-03-20T10:00:00Z"}),
            json!({"status": "Hired", "appliedAt": "2024-04-02T10:00:00Z"}),
        ];
        let out = run(
            json!([
                {"$group": {"_id": {"status": "$status", "month": {"$month": "$appliedAt"}, "year": {"$year": "$appliedAt"}}, "count": {"$sum": 1}}},
                {"$sort": {"_id.month": 1}}
            ]),
            docs,
            &HashMap::new(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], json!({"status": "Applied", "month": 3, "year": 2024}));
        assert_eq!(out[0]["count"], 2);
    }

    #[test]
    fn test_unwind_then_group() {
        let docs = vec![
            json!({"skills": [{"name": "Rust", "proficiencyLevel": 4}, {"name": "Go", "proficiencyLevel": 2}]}),
            json!({"skills": [{"name": "Rust", "proficiencyLevel": 2}]}),
            json!({"skills": []}),
        ];
        let out = run(
            json!([
                {"$unwind": "$skills"},
                {"$group": {"_id": "$skills.name", "count": {"$sum": 1}, "avgProficiency": {"$avg": "$skills.proficiencyLevel"}}},
                {"$sort": {"count": -1}}
            ]),
            docs,
            &HashMap::new(),
        );
        assert_eq!(out[0], json!({"_id": "Rust", "count": 2, "avgProficiency": 3.0}));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_lookup_project_size_filter() {
        let mut collections = HashMap::new();
        collections.insert(
            "jobs".to_string(),
            vec![
                json!({"_id": "j1", "postedBy": "u1", "status": "Active"}),
                json!({"_id": "j2", "postedBy": "u1", "status": "Closed"}),
                json!({"_id": "j3", "postedBy": "u2", "status": "Active"}),
            ],
        );
        let docs = vec![json!({"_id": "e1", "userId": "u1", "firstName": "Amal"})];
        let out = run(
            json!([
                {"$lookup": {"from": "jobs", "localField": "userId", "foreignField": "postedBy", "as": "postedJobs"}},
                {"$project": {
                    "firstName": 1,
                    "totalJobsPosted": {"$size": "$postedJobs"},
                    "activeJobs": {"$size": {"$filter": {"input": "$postedJobs", "cond": {"$eq": ["$$this.status", "Active"]}}}}
                }}
            ]),
            docs,
            &collections,
        );
        assert_eq!(
            out,
            vec![json!({"_id": "e1", "firstName": "Amal", "totalJobsPosted": 2, "activeJobs": 1})]
        );
    }

    #[test]
    fn test_count_stage() {
        let out = run(json!([{"$count": "total"}]), vec![json!({}), json!({})], &HashMap::new());
        assert_eq!(out, vec![json!({"total": 2})]);
        assert!(run(json!([{"$count": "total"}]), vec![], &HashMap::new()).is_empty());
    }

    #[test]
    fn test_rejects_writing_and_unknown_stages() {
        for stage in [
            json!({"$out": "users"}),
            json!({"$merge": {"into": "users"}}),
            json!({"$function": {}}),
            json!({"$match": {}, "$limit": 1}),
        ] {
            assert!(Pipeline::parse(&[stage]).is_err());
        }
    }

    #[test]
    fn test_text_match_must_be_first() {
        let stages = vec![
            json!({"$limit": 5}),
            json!({"$match": {"$text": {"$search": "rust"}}}),
        ];
        assert!(Pipeline::parse(&stages).is_err());

        let pipeline = Pipeline::parse(&[json!({"$match": {"$text": {"$search": "rust"}}})]).unwrap();
        assert!(pipeline.uses_text());
    }

    #[test]
    fn test_evaluate_expressions() {
        let doc = json!({"a": 2, "b": null, "name": "x"});
        assert_eq!(evaluate(&json!({"$gt": ["$a", 1]}), &doc, &[]).unwrap(), json!(true));
        assert_eq!(evaluate(&json!({"$ifNull": ["$b", "none"]}), &doc, &[]).unwrap(), json!("none"));
        assert_eq!(evaluate(&json!({"$concat": ["$name", "-y"]}), &doc, &[]).unwrap(), json!("x-y"));
        assert_eq!(evaluate(&json!({"$literal": "$a"}), &doc, &[]).unwrap(), json!("$a"));
        assert!(evaluate(&json!("$$missing"), &doc, &[]).is_err());
    }
}
