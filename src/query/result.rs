use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// Outcome of one data store call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub data: Value,
    pub execution_time_ms: u64,
    pub count: u64,
}

impl QueryResult {
    pub fn new(data: Value, elapsed: Duration) -> Self {
        let count = result_count(&data);
        Self {
            data,
            execution_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            count,
        }
    }
}

/// Array length; otherwise 1 for a present result and 0 for none.
///
/// A zero count, `false` and the empty string read as no result.
pub fn result_count(data: &Value) -> u64 {
    match data {
        Value::Array(items) => items.len() as u64,
        Value::Null | Value::Bool(false) => 0,
        Value::Number(n) if n.as_f64() == Some(0.0) => 0,
        Value::String(s) if s.is_empty() => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_count() {
        assert_eq!(result_count(&json!([1, 2, 3])), 3);
        assert_eq!(result_count(&json!([])), 0);
        assert_eq!(result_count(&Value::Null), 0);
        assert_eq!(result_count(&json!({"_id": "u1"})), 1);
        assert_eq!(result_count(&json!(42)), 1);
    }

    #[test]
    fn test_zero_count_is_no_result() {
        assert_eq!(result_count(&json!(0)), 0);
        assert_eq!(result_count(&json!(0.0)), 0);
        assert_eq!(result_count(&json!(false)), 0);
        assert_eq!(result_count(&json!(1)), 1);
    }

    #[test]
    fn test_execution_time_in_millis() {
        let result = QueryResult::new(json!([]), Duration::from_micros(2_500));
        assert_eq!(result.execution_time_ms, 2);
    }
}
