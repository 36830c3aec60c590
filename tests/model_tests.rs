//! Unit tests for request/response models and the custom query boundary.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;

// Run with: cargo test --test model_tests

mod request_tests {
    use super::*;
    use query_gateway::models::ExecuteRequest;
    use query_gateway::query::CustomQueryRequest;

    #[test]
    fn test_execute_request_without_parameters() {
        let request: ExecuteRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.parameters.is_empty());
    }

    #[test]
    fn test_execute_request_keeps_unknown_parameters() {
        let request: ExecuteRequest = serde_json::from_value(json!({
            "parameters": {"industry": "Finance", "somethingElse": [1, 2]}
        }))
        .unwrap();
        assert_eq!(request.parameters.len(), 2);
        assert_eq!(request.parameters["somethingElse"], json!([1, 2]));
    }

    #[test]
    fn test_custom_query_request_defaults() {
        let request: CustomQueryRequest = serde_json::from_value(json!({})).unwrap();
        assert!(request.query.is_null());
        assert!(request.operation.is_none());
        assert!(request.options.is_none());
    }

    #[test]
    fn test_custom_query_request_options() {
        let request: CustomQueryRequest = serde_json::from_value(json!({
            "query": {"status": "Active"},
            "operation": "find",
            "options": {"limit": 5, "skip": 10, "sort": {"postedDate": -1}, "populate": "companyId"}
        }))
        .unwrap();
        let options = request.options.unwrap();
        assert_eq!(options.limit, Some(5));
        assert_eq!(options.skip, Some(10));
        assert_eq!(options.populate, Some(json!("companyId")));
    }

    #[test]
    fn test_custom_query_request_negative_limit_parses() {
        let request: CustomQueryRequest =
            serde_json::from_value(json!({"options": {"limit": -3}})).unwrap();
        assert_eq!(request.options.unwrap().limit, Some(-3));
    }
}

mod validation_tests {
    use super::*;
    use query_gateway::ApiError;
    use query_gateway::query::custom::{CustomQuery, CustomQueryLimits, find_forbidden, validate_request};
    use query_gateway::query::{Collection, CustomQueryRequest, Operation};

    fn request(body: serde_json::Value) -> CustomQueryRequest {
        serde_json::from_value(body).unwrap()
    }

    fn validate(collection: &str, body: serde_json::Value) -> Result<(), ApiError> {
        validate_request(collection, &request(body), &CustomQueryLimits::default()).map(|_| ())
    }

    #[test]
    fn test_collection_names_are_case_insensitive() {
        assert_eq!("JobSeekerProfiles".parse::<Collection>().unwrap(), Collection::JobSeekerProfiles);
        assert!("sessions".parse::<Collection>().is_err());
    }

    #[test]
    fn test_operation_defaults_to_find() {
        let validated =
            validate_request("jobs", &request(json!({"query": {}})), &CustomQueryLimits::default())
                .unwrap();
        assert_eq!(validated.operation, Operation::Find);
        assert_eq!(validated.options.limit, 20);
        assert!(matches!(validated.query, CustomQuery::Filter(_)));
    }

    #[test]
    fn test_mutating_operations_are_forbidden() {
        for op in ["insertOne", "deleteMany", "updateOne", "drop", "bulkWrite"] {
            let err = validate("jobs", json!({"query": {}, "operation": op})).unwrap_err();
            assert!(matches!(err, ApiError::Forbidden(_)), "{op}");
        }
    }

    #[test]
    fn test_unknown_operation_is_validation_error() {
        let err = validate("jobs", json!({"query": {}, "operation": "distinct"})).unwrap_err();
        assert!(matches!(err, ApiError::Validation { .. }));
    }

    #[test]
    fn test_collection_is_checked_before_operation() {
        let err = validate("sessions", json!({"query": {}, "operation": "insertOne"})).unwrap_err();
        assert!(matches!(err, ApiError::Validation { .. }));
    }

    #[test]
    fn test_query_shape_must_match_operation() {
        assert!(validate("jobs", json!({"query": [], "operation": "find"})).is_err());
        assert!(validate("jobs", json!({"query": {}, "operation": "aggregate"})).is_err());
        assert!(validate("jobs", json!({"query": "status", "operation": "count"})).is_err());
        assert!(validate("jobs", json!({"query": [], "operation": "aggregate"})).is_ok());
    }

    #[test]
    fn test_forbidden_scan_finds_nested_verbs() {
        assert!(find_forbidden(r#"[{"$match":{"a":{"b":"DELETEMANY"}}}]"#).is_some());
        assert!(find_forbidden(r#"[{"$merge":{"into":"x"}}]"#).is_some());
        assert!(find_forbidden(r#"{"$where":"sleep(1)"}"#).is_some());
        assert!(find_forbidden(r#"{"$drop":1}"#).is_some());
    }

    #[test]
    fn test_forbidden_scan_ignores_words_containing_verbs() {
        assert!(find_forbidden(r#"{"title":"Creative Director","createdAt":{"$gte":"2024"}}"#).is_none());
        assert!(find_forbidden(r#"{"dropoutRate":{"$lt":0.2}}"#).is_none());
    }

    #[test]
    fn test_limits_clamp() {
        let limits = CustomQueryLimits::default();
        assert_eq!(limits.clamp(None), 20);
        assert_eq!(limits.clamp(Some(0)), 20);
        assert_eq!(limits.clamp(Some(-5)), 20);
        assert_eq!(limits.clamp(Some(50)), 50);
        assert_eq!(limits.clamp(Some(10_000)), 100);
    }
}

mod envelope_tests {
    use super::*;
    use axum::http::StatusCode;
    use query_gateway::ApiError;
    use query_gateway::error::{ErrorTranslator, REDACTED_INTERNAL_MESSAGE};

    #[test]
    fn test_validation_envelope() {
        let (envelope, status) = ErrorTranslator::production().handle(&ApiError::validation_with(
            "Missing parameter 'industry'",
            json!({"industry": "required"}),
        ));
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "validation_error");
        assert_eq!(value["statusCode"], 400);
        assert_eq!(value["details"]["industry"], "required");
        assert!(value.get("retryAfter").is_none());
    }

    #[test]
    fn test_rate_limited_envelope_carries_retry_after() {
        let (envelope, status) = ErrorTranslator::production().handle(&ApiError::rate_limited(42));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(serde_json::to_value(&envelope).unwrap()["retryAfter"], 42);
    }

    #[test]
    fn test_internal_message_depends_on_mode() {
        let error = ApiError::internal("store connection reset");

        let (envelope, _) = ErrorTranslator::production().handle(&error);
        assert_eq!(envelope.message, REDACTED_INTERNAL_MESSAGE);
        assert!(envelope.details.is_none());

        let (envelope, status) = ErrorTranslator::new(true).handle(&error);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(envelope.message.contains("store connection reset"));
    }

    #[test]
    fn test_bare_status_envelope() {
        let envelope = ErrorTranslator::production().handle_status(StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(envelope.error, "method_not_allowed");
        assert_eq!(envelope.status_code, 405);
    }
}
