//! Integration tests for the strata worker API.
//!
//! Uses axum-test to drive the router without binding a socket, plus one
//! real listener to exercise the HTTP invoker end to end.

#![allow(clippy::unwrap_used, clippy::panic)]

use axum::http::HeaderValue;
use axum_test::TestServer;
use serde_json::{Value, json};
use std::sync::Arc;
use strata::api::{HealthResponse, StatusResponse, WorkerState, create_router};
use strata::config::{FanOutConfig, WorkerConfig};
use strata::fanout::{FanOut, FanOutResults, Fault, HttpInvoker, InvocationError, WorkItem, build_plan};
use strata::pipeline::{CLAIM_TASK, PipelineStores};
use strata_core::StrataError;

const STEM: &str = r##"#vertex#Patient#{"id_source":"Algernon"}#"##;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn worker_config(api_key: Option<&str>) -> WorkerConfig {
    WorkerConfig {
        rate_limit: 0,
        api_key: api_key.map(str::to_string),
        ..WorkerConfig::default()
    }
}

fn create_test_server(api_key: Option<&str>) -> (TestServer, PipelineStores) {
    let stores = PipelineStores::memory();
    let state = WorkerState::local(stores.tasks(), stores.graph.clone());
    let router = create_router(state, &worker_config(api_key));
    (TestServer::new(router).unwrap(), stores)
}

fn claim_payload(plan: Option<Value>, item: Option<Value>) -> Value {
    json!({
        "m_plan": plan,
        "m_concurrency": 4,
        "task_name": CLAIM_TASK,
        "worker_ref": "test",
        "task_constants": { "identifier_stem": STEM, "object_type": "Patient" },
        "worker_args": item,
    })
}

fn claim_item(id: i64) -> WorkItem {
    WorkItem::new(id.to_string(), json!({ "id_value": id }))
}

// =============================================================================
// HEALTH & STATUS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _) = create_test_server(None);
    let response = server.get("/health").await;

    response.assert_status_ok();
    let health: HealthResponse = response.json();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_status_lists_tasks() {
    let (server, _) = create_test_server(None);
    let response = server.get("/status").await;

    response.assert_status_ok();
    let status: StatusResponse = response.json();
    assert_eq!(status.tasks, vec![CLAIM_TASK.to_string()]);
    assert_eq!(status.vertex_count, 0);
    assert_eq!(status.edge_count, 0);
}

// =============================================================================
// INVOKE
// =============================================================================

#[tokio::test]
async fn test_invoke_single_claim_wins_once() {
    let (server, stores) = create_test_server(None);
    let item = serde_json::to_value(claim_item(1002)).unwrap();

    let first = server.post("/invoke").json(&claim_payload(None, Some(item.clone()))).await;
    first.assert_status_ok();
    assert_eq!(first.json::<Value>(), json!(true));

    let second = server.post("/invoke").json(&claim_payload(None, Some(item))).await;
    second.assert_status_ok();
    assert_eq!(second.json::<Value>(), json!(false));

    assert_eq!(stores.state.query_max(STEM).unwrap(), 1002);
}

#[tokio::test]
async fn test_invoke_plan_returns_results() {
    let (server, stores) = create_test_server(None);
    let plan = build_plan((1..=12).map(claim_item).collect(), 5, 2);

    let response = server
        .post("/invoke")
        .json(&claim_payload(Some(serde_json::to_value(plan).unwrap()), None))
        .await;

    response.assert_status_ok();
    let results: FanOutResults = response.json();
    assert_eq!(results.results.len(), 12);
    assert!(results.results.values().all(|won| *won == json!(true)));
    assert!(results.failed.is_empty());
    assert_eq!(stores.state.query_max(STEM).unwrap(), 12);
}

#[tokio::test]
async fn test_invoke_unknown_task_is_caller_fault() {
    let (server, _) = create_test_server(None);
    let mut payload = claim_payload(None, Some(json!({ "key": "1", "args": { "id_value": 1 } })));
    payload["task_name"] = json!("reconcile");

    let response = server.post("/invoke").json(&payload).await;

    assert_eq!(response.status_code().as_u16(), 422);
    let error: InvocationError = response.json();
    assert_eq!(error.fault(), Fault::Caller);
    assert!(error.error_message.contains("reconcile"));
}

#[tokio::test]
async fn test_invoke_bad_item_is_caller_fault() {
    let (server, _) = create_test_server(None);
    let response = server
        .post("/invoke")
        .json(&claim_payload(None, Some(json!({ "key": "x", "args": {} }))))
        .await;

    assert_eq!(response.status_code().as_u16(), 422);
    let body: Value = response.json();
    assert_eq!(body["errorType"], json!("CallerFault"));
}

#[tokio::test]
async fn test_invoke_empty_payload_rejected() {
    let (server, _) = create_test_server(None);
    let response = server.post("/invoke").json(&claim_payload(None, None)).await;
    assert_eq!(response.status_code().as_u16(), 422);
}

// =============================================================================
// AUTHENTICATION & RATE LIMITING
// =============================================================================

#[tokio::test]
async fn test_auth_valid_bearer_token() {
    let api_key = "test-secret-key-12345";
    let (server, _) = create_test_server(Some(api_key));

    let response = server
        .get("/status")
        .add_header(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", api_key)
                .parse::<HeaderValue>()
                .unwrap(),
        )
        .await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_auth_invalid_token_rejected() {
    let (server, _) = create_test_server(Some("correct-key"));

    let response = server
        .post("/invoke")
        .add_header(
            axum::http::header::AUTHORIZATION,
            "Bearer wrong-key".parse::<HeaderValue>().unwrap(),
        )
        .json(&claim_payload(None, None))
        .await;

    assert_eq!(
        response.status_code().as_u16(),
        401,
        "Invalid token should return 401 Unauthorized"
    );
}

#[tokio::test]
async fn test_auth_missing_header_rejected() {
    let (server, _) = create_test_server(Some("required-key"));
    let response = server.get("/status").await;
    assert_eq!(response.status_code().as_u16(), 401);
}

#[tokio::test]
async fn test_auth_health_endpoint_bypasses_auth() {
    let (server, _) = create_test_server(Some("secret-key-for-bypass-test"));
    let response = server.get("/health").await;
    response.assert_status_ok();
}

#[tokio::test]
async fn test_rate_limit_rejects_burst() {
    let stores = PipelineStores::memory();
    let state = WorkerState::local(stores.tasks(), stores.graph.clone());
    let config = WorkerConfig {
        rate_limit: 1,
        ..WorkerConfig::default()
    };
    let server = TestServer::new(create_router(state, &config)).unwrap();

    server.get("/health").await.assert_status_ok();
    let limited = server.get("/health").await;
    assert_eq!(limited.status_code().as_u16(), 429);
}

// =============================================================================
// HTTP INVOKER
// =============================================================================

async fn spawn_worker(api_key: Option<&str>) -> (String, PipelineStores) {
    let stores = PipelineStores::memory();
    let state = WorkerState::local(stores.tasks(), stores.graph.clone());
    let router = create_router(state, &worker_config(api_key));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), stores)
}

fn http_fanout(url: &str, api_key: Option<&str>) -> FanOut {
    let config = FanOutConfig {
        branching_cap: 3,
        concurrency: 6,
        retry_ceiling: 1,
        ..FanOutConfig::default()
    };
    FanOut::new(
        Arc::new(HttpInvoker::new(url, api_key.map(str::to_string))),
        config,
    )
}

#[tokio::test]
async fn test_http_invoker_runs_fanout_on_worker() {
    let (url, stores) = spawn_worker(Some("k3y")).await;
    let fanout = http_fanout(&url, Some("k3y"));
    let constants = json!({ "identifier_stem": STEM, "object_type": "Patient" });

    let results = fanout
        .run(CLAIM_TASK, constants.clone(), (1..=25).map(claim_item).collect())
        .await;
    assert!(results.is_complete());
    assert_eq!(results.results.len(), 25);
    assert_eq!(results.attempts, 1);
    assert_eq!(stores.state.query_max(STEM).unwrap(), 25);

    let again = fanout
        .run(CLAIM_TASK, constants, (20..=30).map(claim_item).collect())
        .await;
    let won = again.results.values().filter(|v| **v == json!(true)).count();
    assert_eq!(won, 5);
}

#[tokio::test]
async fn test_http_invoker_unauthorized_is_not_retried() {
    let (url, _) = spawn_worker(Some("k3y")).await;
    let fanout = http_fanout(&url, Some("wrong"));
    let constants = json!({ "identifier_stem": STEM, "object_type": "Patient" });

    let results = fanout.run(CLAIM_TASK, constants, (1..=4).map(claim_item).collect()).await;

    assert_eq!(results.failed.len(), 4);
    assert!(results.failed.iter().all(|f| f.fault == Fault::Caller));
    assert_eq!(results.resubmitted, 0);
    assert!(matches!(
        results.failure(),
        Some(StrataError::FanOutRejected { rejected: 4, .. })
    ));
}
