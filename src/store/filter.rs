//! Filter documents: parsing and matching.
//!
//! # Supported Operators
//!
//! | Kind        | Operators                                                        |
//! |-------------|------------------------------------------------------------------|
//! | Comparison  | `$eq $ne $gt $gte $lt $lte $in $nin`                             |
//! | Element     | `$exists $size $all $elemMatch $not $regex` (`$options`: `imsx`) |
//! | Logical     | `$and $or $nor`                                                  |
//! | Text        | `$text {$search}` (needs a text index)                           |
//! | Geospatial  | `$near`/`$nearSphere` (needs a 2dsphere index), `$geoWithin`     |
//!
//! Anything else, including `$where` and `$expr`, is rejected.

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value, json};

use super::document::{compare_values, lookup, values_equal};
use super::{StoreError, StoreResult};

/// Mean earth radius in metres used for distance calculations.
pub const EARTH_RADIUS_M: f64 = 6_378_100.0;

/// Metres per degree of latitude.
const METRES_PER_DEGREE: f64 = 111_320.0;

/// A longitude/latitude pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub lng: f64,
    pub lat: f64,
}

impl GeoPoint {
    pub const fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    /// Read a GeoJSON point or a legacy `[lng, lat]` pair.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Array(pair) => match pair.as_slice() {
                [lng, lat] => Some(Self::new(lng.as_f64()?, lat.as_f64()?)),
                _ => None,
            },
            Value::Object(map) => {
                if map.get("type").and_then(Value::as_str) != Some("Point") {
                    return None;
                }
                Self::from_value(map.get("coordinates")?)
            }
            _ => None,
        }
    }

    /// Great-circle distance in metres.
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        let (lat1, lat2) = (self.lat.to_radians(), other.lat.to_radians());
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lng = (other.lng - self.lng).to_radians();
        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lng / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// Axis-aligned longitude/latitude rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoBox {
    pub min: GeoPoint,
    pub max: GeoPoint,
}

impl GeoBox {
    /// Smallest box containing the circle of `radius_m` around `center`.
    pub fn around(center: GeoPoint, radius_m: f64) -> Self {
        let d_lat = radius_m / METRES_PER_DEGREE;
        let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
        let d_lng = (radius_m / (METRES_PER_DEGREE * cos_lat)).min(180.0);
        Self {
            min: GeoPoint::new(center.lng - d_lng, (center.lat - d_lat).max(-90.0)),
            max: GeoPoint::new(center.lng + d_lng, (center.lat + d_lat).min(90.0)),
        }
    }

    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min.lng..=self.max.lng).contains(&point.lng)
            && (self.min.lat..=self.max.lat).contains(&point.lat)
    }

    /// `$box` operand: `[[minLng, minLat], [maxLng, maxLat]]`.
    pub fn to_value(&self) -> Value {
        json!([[self.min.lng, self.min.lat], [self.max.lng, self.max.lat]])
    }
}

/// `$near` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Near {
    pub point: GeoPoint,
    pub max_distance: Option<f64>,
    pub min_distance: Option<f64>,
}

impl Near {
    /// Distance to the closest point among `candidates`, if any is in range.
    pub fn distance(&self, candidates: &[&Value]) -> Option<f64> {
        candidates
            .iter()
            .filter_map(|c| GeoPoint::from_value(c))
            .map(|p| self.point.distance_to(&p))
            .filter(|d| self.max_distance.is_none_or(|max| *d <= max))
            .filter(|d| self.min_distance.is_none_or(|min| *d >= min))
            .min_by(f64::total_cmp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone)]
enum Condition {
    Eq(Value),
    Ne(Value),
    Cmp(CmpOp, Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
    Size(usize),
    All(Vec<Value>),
    ElemMatchDocument(Filter),
    ElemMatchValue(Vec<Condition>),
    Not(Vec<Condition>),
    Near(Near),
    WithinBox(GeoBox),
    WithinCircle { center: GeoPoint, radius_m: f64 },
}

#[derive(Debug, Clone)]
enum Clause {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Nor(Vec<Filter>),
    Text(TextSearch),
    Field {
        path: String,
        conditions: Vec<Condition>,
    },
}

/// Parsed `$text` search.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSearch {
    terms: Vec<String>,
    excluded: Vec<String>,
}

impl TextSearch {
    pub fn parse(search: &str) -> Self {
        let mut terms = Vec::new();
        let mut excluded = Vec::new();
        for raw in search.split_whitespace() {
            let (negated, word) = match raw.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };
            for token in tokenize(word) {
                if negated {
                    excluded.push(token);
                } else {
                    terms.push(token);
                }
            }
        }
        Self { terms, excluded }
    }

    /// Occurrences of the search terms across `fields` of `doc`; zero means no match.
    pub fn score(&self, doc: &Value, fields: &[String]) -> f64 {
        let tokens: Vec<String> = fields
            .iter()
            .flat_map(|field| lookup(doc, field))
            .flat_map(text_of)
            .flat_map(|text| tokenize(&text))
            .collect();

        if self.excluded.iter().any(|ex| tokens.contains(ex)) {
            return 0.0;
        }

        let hits = tokens.iter().filter(|t| self.terms.contains(t)).count();
        hits as f64
    }
}

fn text_of(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(text_of).collect(),
        _ => Vec::new(),
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Evaluation context for index-backed operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchContext<'a> {
    /// Fields covered by the collection's text index.
    pub text_fields: &'a [String],
}

/// A compiled filter document. Top-level clauses are ANDed.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    /// Compile a filter document.
    pub fn parse(value: &Value) -> StoreResult<Self> {
        let map = match value {
            Value::Object(map) => map,
            Value::Null => return Ok(Self::default()),
            other => {
                return Err(StoreError::invalid(format!(
                    "filter must be an object, got {other}"
                )));
            }
        };

        let mut clauses = Vec::with_capacity(map.len());
        for (key, operand) in map {
            let clause = match key.as_str() {
                "$and" => Clause::And(parse_filter_list(key, operand)?),
                "$or" => Clause::Or(parse_filter_list(key, operand)?),
                "$nor" => Clause::Nor(parse_filter_list(key, operand)?),
                "$text" => Clause::Text(parse_text(operand)?),
                op if op.starts_with('$') => {
                    return Err(StoreError::invalid(format!(
                        "unsupported top-level operator '{op}'"
                    )));
                }
                path => Clause::Field {
                    path: path.to_string(),
                    conditions: parse_conditions(path, operand)?,
                },
            };
            clauses.push(clause);
        }
        Ok(Self { clauses })
    }

    pub fn matches(&self, doc: &Value, ctx: &MatchContext<'_>) -> bool {
        self.clauses.iter().all(|clause| clause_matches(clause, doc, ctx))
    }

    /// The top-level `$text` search, if any.
    pub fn text_search(&self) -> Option<&TextSearch> {
        self.clauses.iter().find_map(|clause| match clause {
            Clause::Text(search) => Some(search),
            _ => None,
        })
    }

    /// Whether any clause, at any depth, uses `$text`.
    pub fn uses_text(&self) -> bool {
        self.clauses.iter().any(|clause| match clause {
            Clause::Text(_) => true,
            Clause::And(fs) | Clause::Or(fs) | Clause::Nor(fs) => fs.iter().any(Filter::uses_text),
            Clause::Field { .. } => false,
        })
    }

    /// Paths constrained by `$near`, at any depth.
    pub fn near_paths(&self) -> Vec<&str> {
        let mut paths = Vec::new();
        for clause in &self.clauses {
            match clause {
                Clause::Field { path, conditions } => {
                    if conditions.iter().any(|c| matches!(c, Condition::Near(_))) {
                        paths.push(path.as_str());
                    }
                }
                Clause::And(fs) | Clause::Or(fs) | Clause::Nor(fs) => {
                    paths.extend(fs.iter().flat_map(Filter::near_paths));
                }
                Clause::Text(_) => {}
            }
        }
        paths
    }

    /// The top-level `$near` clause used to order results by distance.
    pub fn near(&self) -> Option<(&str, &Near)> {
        self.clauses.iter().find_map(|clause| match clause {
            Clause::Field { path, conditions } => conditions.iter().find_map(|c| match c {
                Condition::Near(near) => Some((path.as_str(), near)),
                _ => None,
            }),
            _ => None,
        })
    }
}

fn parse_filter_list(op: &str, operand: &Value) -> StoreResult<Vec<Filter>> {
    match operand {
        Value::Array(items) if !items.is_empty() => items.iter().map(Filter::parse).collect(),
        _ => Err(StoreError::invalid(format!(
            "'{op}' expects a non-empty array"
        ))),
    }
}

fn parse_text(operand: &Value) -> StoreResult<TextSearch> {
    let search = operand
        .get("$search")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::invalid("'$text' requires a '$search' string"))?;
    Ok(TextSearch::parse(search))
}

fn is_operator_object(map: &Map<String, Value>) -> StoreResult<bool> {
    let operators = map.keys().filter(|k| k.starts_with('$')).count();
    match operators {
        0 => Ok(false),
        n if n == map.len() => Ok(true),
        _ => Err(StoreError::invalid(
            "cannot mix operators and plain fields in one condition",
        )),
    }
}

fn parse_conditions(path: &str, operand: &Value) -> StoreResult<Vec<Condition>> {
    let map = match operand {
        Value::Object(map) if !map.is_empty() => map,
        literal => return Ok(vec![Condition::Eq(literal.clone())]),
    };
    if !is_operator_object(map)? {
        return Ok(vec![Condition::Eq(operand.clone())]);
    }

    let options = map.get("$options").and_then(Value::as_str).unwrap_or("");
    let mut conditions = Vec::with_capacity(map.len());
    for (op, arg) in map {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(arg.clone()),
            "$ne" => Condition::Ne(arg.clone()),
            "$gt" => Condition::Cmp(CmpOp::Gt, arg.clone()),
            "$gte" => Condition::Cmp(CmpOp::Gte, arg.clone()),
            "$lt" => Condition::Cmp(CmpOp::Lt, arg.clone()),
            "$lte" => Condition::Cmp(CmpOp::Lte, arg.clone()),
            "$in" => Condition::In(expect_array(op, arg)?),
            "$nin" => Condition::Nin(expect_array(op, arg)?),
            "$all" => Condition::All(expect_array(op, arg)?),
            "$exists" => Condition::Exists(truthy(arg)),
            "$size" => Condition::Size(
                arg.as_u64()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| StoreError::invalid("'$size' expects a non-negative integer"))?,
            ),
            "$regex" => Condition::Regex(compile_regex(arg, options)?),
            "$options" => {
                if !map.contains_key("$regex") {
                    return Err(StoreError::invalid("'$options' without '$regex'"));
                }
                continue;
            }
            "$elemMatch" => parse_elem_match(path, arg)?,
            "$not" => match arg {
                Value::Object(_) => Condition::Not(parse_conditions(path, arg)?),
                Value::String(_) => Condition::Not(vec![Condition::Regex(compile_regex(arg, "")?)]),
                _ => return Err(StoreError::invalid("'$not' expects an operator object")),
            },
            "$near" | "$nearSphere" => Condition::Near(parse_near(arg)?),
            "$geoWithin" => parse_geo_within(arg)?,
            other => {
                return Err(StoreError::invalid(format!(
                    "unsupported operator '{other}' on '{path}'"
                )));
            }
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn expect_array(op: &str, arg: &Value) -> StoreResult<Vec<Value>> {
    arg.as_array()
        .cloned()
        .ok_or_else(|| StoreError::invalid(format!("'{op}' expects an array")))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::Null => false,
        _ => true,
    }
}

fn compile_regex(pattern: &Value, options: &str) -> StoreResult<Regex> {
    let pattern = pattern
        .as_str()
        .ok_or_else(|| StoreError::invalid("'$regex' expects a string"))?;
    let mut builder = RegexBuilder::new(pattern);
    for flag in options.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            other => {
                return Err(StoreError::invalid(format!(
                    "unsupported regex option '{other}'"
                )));
            }
        };
    }
    builder
        .size_limit(1 << 20)
        .build()
        .map_err(|e| StoreError::invalid(format!("invalid regex: {e}")))
}

fn parse_elem_match(path: &str, arg: &Value) -> StoreResult<Condition> {
    match arg {
        Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
            if map.keys().any(|k| matches!(k.as_str(), "$and" | "$or" | "$nor")) {
                return Ok(Condition::ElemMatchDocument(Filter::parse(arg)?));
            }
            Ok(Condition::ElemMatchValue(parse_conditions(path, arg)?))
        }
        Value::Object(_) => Ok(Condition::ElemMatchDocument(Filter::parse(arg)?)),
        _ => Err(StoreError::invalid("'$elemMatch' expects an object")),
    }
}

fn parse_near(arg: &Value) -> StoreResult<Near> {
    let invalid = || StoreError::invalid("'$near' expects a '$geometry' point or [lng, lat]");
    let (point, max_distance, min_distance) = match arg {
        Value::Object(map) => {
            let geometry = map.get("$geometry").ok_or_else(invalid)?;
            (
                GeoPoint::from_value(geometry).ok_or_else(invalid)?,
                map.get("$maxDistance").and_then(Value::as_f64),
                map.get("$minDistance").and_then(Value::as_f64),
            )
        }
        Value::Array(_) => (GeoPoint::from_value(arg).ok_or_else(invalid)?, None, None),
        _ => return Err(invalid()),
    };
    Ok(Near {
        point,
        max_distance,
        min_distance,
    })
}

fn parse_geo_within(arg: &Value) -> StoreResult<Condition> {
    if let Some(corners) = arg.get("$box") {
        let (min, max) = match corners.as_array().map(Vec::as_slice) {
            Some([a, b]) => (GeoPoint::from_value(a), GeoPoint::from_value(b)),
            _ => (None, None),
        };
        return match (min, max) {
            (Some(a), Some(b)) => Ok(Condition::WithinBox(GeoBox {
                min: GeoPoint::new(a.lng.min(b.lng), a.lat.min(b.lat)),
                max: GeoPoint::new(a.lng.max(b.lng), a.lat.max(b.lat)),
            })),
            _ => Err(StoreError::invalid("'$box' expects two [lng, lat] corners")),
        };
    }
    if let Some(circle) = arg.get("$centerSphere") {
        if let Some([center, radius]) = circle.as_array().map(Vec::as_slice)
            && let (Some(center), Some(radians)) = (GeoPoint::from_value(center), radius.as_f64())
        {
            return Ok(Condition::WithinCircle {
                center,
                radius_m: radians * EARTH_RADIUS_M,
            });
        }
        return Err(StoreError::invalid(
            "'$centerSphere' expects [[lng, lat], radiusRadians]",
        ));
    }
    Err(StoreError::invalid(
        "'$geoWithin' supports '$box' and '$centerSphere'",
    ))
}

fn clause_matches(clause: &Clause, doc: &Value, ctx: &MatchContext<'_>) -> bool {
    match clause {
        Clause::And(filters) => filters.iter().all(|f| f.matches(doc, ctx)),
        Clause::Or(filters) => filters.iter().any(|f| f.matches(doc, ctx)),
        Clause::Nor(filters) => !filters.iter().any(|f| f.matches(doc, ctx)),
        Clause::Text(search) => search.score(doc, ctx.text_fields) > 0.0,
        Clause::Field { path, conditions } => {
            let candidates = lookup(doc, path);
            conditions
                .iter()
                .all(|c| condition_matches(c, &candidates, ctx))
        }
    }
}

/// Candidates plus the elements of any array candidate.
fn expanded<'a>(candidates: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        out.push(*candidate);
        if let Value::Array(items) = candidate {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(candidates: &[&Value], target: &Value) -> bool {
    if target.is_null() && candidates.is_empty() {
        return true;
    }
    expanded(candidates)
        .into_iter()
        .any(|c| values_equal(c, target))
}

fn same_class(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
    )
}

fn condition_matches(condition: &Condition, candidates: &[&Value], ctx: &MatchContext<'_>) -> bool {
    match condition {
        Condition::Eq(target) => equals_any(candidates, target),
        Condition::Ne(target) => !equals_any(candidates, target),
        Condition::Cmp(op, target) => expanded(candidates).into_iter().any(|c| {
            same_class(c, target) && {
                let ord = compare_values(c, target);
                match op {
                    CmpOp::Gt => ord.is_gt(),
                    CmpOp::Gte => ord.is_ge(),
                    CmpOp::Lt => ord.is_lt(),
                    CmpOp::Lte => ord.is_le(),
                }
            }
        }),
        Condition::In(targets) => targets.iter().any(|t| equals_any(candidates, t)),
        Condition::Nin(targets) => !targets.iter().any(|t| equals_any(candidates, t)),
        Condition::Exists(should_exist) => !candidates.is_empty() == *should_exist,
        Condition::Regex(re) => expanded(candidates)
            .into_iter()
            .any(|c| c.as_str().is_some_and(|s| re.is_match(s))),
        Condition::Size(len) => candidates
            .iter()
            .any(|c| c.as_array().is_some_and(|items| items.len() == *len)),
        Condition::All(targets) => candidates.iter().any(|c| {
            c.as_array().is_some_and(|items| {
                targets
                    .iter()
                    .all(|t| items.iter().any(|item| values_equal(item, t)))
            })
        }),
        Condition::ElemMatchDocument(filter) => candidates.iter().any(|c| {
            c.as_array()
                .is_some_and(|items| items.iter().any(|item| filter.matches(item, ctx)))
        }),
        Condition::ElemMatchValue(conditions) => candidates.iter().any(|c| {
            c.as_array().is_some_and(|items| {
                items.iter().any(|item| {
                    conditions
                        .iter()
                        .all(|cond| condition_matches(cond, &[item], ctx))
                })
            })
        }),
        Condition::Not(conditions) => !conditions
            .iter()
            .all(|c| condition_matches(c, candidates, ctx)),
        Condition::Near(near) => near.distance(candidates).is_some(),
        Condition::WithinBox(area) => candidates
            .iter()
            .filter_map(|c| GeoPoint::from_value(c))
            .any(|p| area.contains(&p)),
        Condition::WithinCircle { center, radius_m } => candidates
            .iter()
            .filter_map(|c| GeoPoint::from_value(c))
            .any(|p| center.distance_to(&p) <= *radius_m),
    }
}
