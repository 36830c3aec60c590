//! End-to-end tests against a real server on an ephemeral port.
//!
//! Each fixture binds its own listener and serves the bundled seed data from
//! an in-memory store, so the tests need no external services.
//!
//! Run with: `cargo test --test integration_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::sleep;

use query_gateway::config::Environment;
use query_gateway::store::MemoryStore;
use query_gateway::{AppState, Config, build_router};

const SEED: &str = include_str!("../data/seed.json");

/// Test fixture that owns a running app server.
struct TestFixture {
    base_url: String,
    client: Client,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_config(Config {
            log_level: "warn".to_string(),
            ..Config::default()
        })
        .await
    }

    async fn with_config(config: Config) -> Self {
        let store = MemoryStore::from_value(serde_json::from_str(SEED).expect("seed is valid JSON"))
            .expect("seed loads");
        let state = AppState::new(config, Arc::new(store));
        let app = build_router(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().expect("local address"));

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Server failed");
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        let fixture = Self { base_url, client };
        fixture.wait_for_server().await;
        fixture
    }

    async fn wait_for_server(&self) {
        let max_attempts = 50;
        for attempt in 1..=max_attempts {
            match self.client.get(self.url("/health")).send().await {
                Ok(response) if response.status().is_success() => return,
                _ if attempt == max_attempts => {
                    panic!("Server failed to respond after {max_attempts} attempts")
                }
                _ => sleep(Duration::from_millis(100)).await,
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("POST failed");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.json().await.expect("Failed to parse response");
        (status, headers, body)
    }

    async fn get(&self, path: &str) -> (StatusCode, reqwest::header::HeaderMap, Value) {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .expect("GET failed");
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.json().await.expect("Failed to parse response");
        (status, headers, body)
    }
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let fixture = TestFixture::new().await;

    let (status, headers, body) = fixture.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");
    assert!(body.get("version").is_some());
    assert!(body.get("timestamp").is_some());
    assert!(body["uptime"].is_number());
    assert!(headers.contains_key("x-request-id"));
    assert!(!headers.contains_key("x-powered-by"));
}

// ============================================================================
// Catalog queries
// ============================================================================

#[tokio::test]
async fn test_find_companies_by_industry() {
    let fixture = TestFixture::new().await;

    let (status, _, body) = fixture
        .post(
            "/data/execute/basic-find-companies",
            json!({"parameters": {"industry": "Technology", "limit": 5}}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    let count = body["metadata"]["resultCount"].as_u64().unwrap();
    assert!(count <= 5);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len() as u64, count);
    for company in data {
        assert_eq!(company["industry"], "Technology");
    }
}

#[tokio::test]
async fn test_every_catalog_query_runs_with_defaults() {
    let fixture = TestFixture::new().await;

    let (_, _, listing) = fixture.get("/queries").await;
    let ids: Vec<String> = listing["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap().to_string())
        .collect();
    assert!(!ids.is_empty());

    for id in ids {
        let (status, _, body) = fixture
            .post(&format!("/data/execute/{id}"), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK, "{id}: {body}");
        assert_eq!(body["metadata"]["queryId"], id.as_str());
        assert!(body["data"].is_array(), "{id}");
    }
}

#[tokio::test]
async fn test_client_timeout_header_is_accepted() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .post(fixture.url("/data/execute/user-profiles"))
        .header("x-request-timeout", "2000")
        .json(&json!({"parameters": {"role": "Employer"}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["metadata"]["resultCount"], 2);
}

// ============================================================================
// Custom queries
// ============================================================================

#[tokio::test]
async fn test_custom_query_insert_is_forbidden() {
    let fixture = TestFixture::new().await;

    let (status, _, body) = fixture
        .post(
            "/data/execute-custom/users",
            json!({"query": {}, "operation": "insertOne"}),
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "forbidden");
    assert_eq!(body["statusCode"], 403);
}

#[tokio::test]
async fn test_custom_query_with_populate() {
    let fixture = TestFixture::new().await;

    let (status, _, body) = fixture
        .post(
            "/data/execute-custom/applications",
            json!({
                "query": {"status": "Applied"},
                "operation": "find",
                "options": {
                    "populate": {"path": "jobId", "select": {"title": 1}},
                    "sort": {"appliedAt": -1}
                }
            }),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["metadata"]["resultCount"], 2);
    assert_eq!(body["data"][0]["_id"], "a2");
    assert_eq!(body["data"][0]["jobId"]["title"], "Frontend Developer");
}

#[tokio::test]
async fn test_custom_query_populate_rejects_unknown_reference() {
    let fixture = TestFixture::new().await;

    let (status, _, body) = fixture
        .post(
            "/data/execute-custom/users",
            json!({"query": {}, "options": {"populate": "password"}}),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
}

#[tokio::test]
async fn test_custom_query_rate_limit() {
    let fixture = TestFixture::new().await;

    for i in 1..=20 {
        let (status, headers, _) = fixture
            .post(
                "/data/execute-custom/jobs",
                json!({"query": {"status": "Active"}, "operation": "countDocuments"}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "request {i}");
        assert_eq!(
            headers["x-ratelimit-remaining"].to_str().unwrap(),
            (20 - i).to_string()
        );
    }

    let (status, headers, body) = fixture
        .post(
            "/data/execute-custom/jobs",
            json!({"query": {"status": "Active"}, "operation": "countDocuments"}),
        )
        .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key("retry-after"));
    assert_eq!(body["error"], "rate_limited");
    assert!(body["retryAfter"].as_u64().unwrap() >= 1);
}

// ============================================================================
// Errors
// ============================================================================

#[tokio::test]
async fn test_unknown_path_returns_envelope() {
    let fixture = TestFixture::new().await;

    let (status, _, body) = fixture.get("/api/nonexistent").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "not_found");
    assert_eq!(body["statusCode"], 404);
    assert!(body["message"].as_str().unwrap().contains("/api/nonexistent"));
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_production_keeps_validation_messages() {
    let fixture = TestFixture::with_config(Config {
        environment: Environment::Production,
        ..Config::default()
    })
    .await;

    let (status, _, body) = fixture
        .post(
            "/data/execute/nearby-jobs",
            json!({"parameters": {"coordinates": "not a point"}}),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert!(body["message"].as_str().unwrap().contains("coordinates"));
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn test_ensure_indexes_then_stats() {
    let fixture = TestFixture::new().await;

    let (status, _, body) = fixture.post("/admin/ensure-indexes", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let indexes = body["data"]["indexes"].as_array().unwrap();
    assert!(
        indexes
            .iter()
            .any(|i| i["collection"] == "jobs" && i["type"] == "2dsphere")
    );

    let (status, _, body) = fixture.get("/data/stats").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["collections"]["applications"], 4);
    assert_eq!(body["data"]["activeJobs"], 5);
}
