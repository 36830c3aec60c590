//! Dotted-path access and ordering over JSON documents.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

/// Values reachable at `path`.
///
/// Non-numeric segments descend into every object element of an array, so
/// `locations.city` yields the city of each location. Numeric segments index
/// into arrays. A missing path yields nothing.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![doc];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            step(value, segment, &mut next);
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

fn step<'a>(value: &'a Value, segment: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(segment) {
                out.push(child);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = segment.parse::<usize>()
                && let Some(child) = items.get(index)
            {
                out.push(child);
                return;
            }
            for item in items {
                if let Value::Object(map) = item
                    && let Some(child) = map.get(segment)
                {
                    out.push(child);
                }
            }
        }
        _ => {}
    }
}

/// Expression-style resolution: a path through an array of objects yields an
/// array of the nested values.
pub fn resolve(doc: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_segments(doc, &segments)
}

fn resolve_segments(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => resolve_segments(map.get(*first)?, rest),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|item| item.is_object())
                .filter_map(|item| resolve_segments(item, segments))
                .collect(),
        )),
        _ => None,
    }
}

/// Sub-document of `doc` holding only `path`, keeping the original nesting.
pub fn project_path(doc: &Value, path: &str) -> Option<Value> {
    let (head, tail) = match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    };
    match doc {
        Value::Object(map) => {
            let child = map.get(head)?;
            let projected = match tail {
                None => child.clone(),
                Some(rest) => project_path(child, rest)?,
            };
            let mut out = Map::new();
            out.insert(head.to_string(), projected);
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| project_path(item, path))
                .collect(),
        )),
        _ => None,
    }
}

/// Deep-merge `source` into `target`. Objects merge key by key, equally long
/// arrays merge element-wise, anything else is replaced.
pub fn merge_into(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(t), Value::Object(s)) => {
            for (key, value) in s {
                match t.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        t.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(t), Value::Array(s)) if t.len() == s.len() => {
            for (existing, value) in t.iter_mut().zip(s) {
                merge_into(existing, value);
            }
        }
        (t, s) => *t = s,
    }
}

/// Set `path` to `value`, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let (head, tail) = match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    };
    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    let Value::Object(map) = doc else {
        return;
    };
    match tail {
        None => {
            map.insert(head.to_string(), value);
        }
        Some(rest) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, value);
        }
    }
}

/// Remove `path`, descending into arrays.
pub fn remove_path(doc: &mut Value, path: &str) {
    let (head, tail) = match path.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (path, None),
    };
    match doc {
        Value::Object(map) => match tail {
            None => {
                map.remove(head);
            }
            Some(rest) => {
                if let Some(child) = map.get_mut(head) {
                    remove_path(child, rest);
                }
            }
        },
        Value::Array(items) => {
            for item in items {
                remove_path(item, path);
            }
        }
        _ => {}
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

/// Total order across JSON values: null < numbers < strings < objects < arrays < booleans.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Interpret a value as a timestamp: RFC 3339 strings, plain dates, or `{"$date": ...}`.
pub fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|naive| naive.and_utc())
            }),
        Value::Object(map) => map.get("$date").and_then(as_datetime),
        _ => None,
    }
}
