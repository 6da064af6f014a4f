use axum::http::StatusCode;
use axum_test::TestServer;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;

use txflow::api::{create_router, AppState};
use txflow::{
    register_all, ActivityRegistry, Client, ConnectionOptions, Engine, FlowConfig,
    TransactionLatencies, TransactionLedger, WorkerHandle, WorkerOptions, WorkerPool,
    TASK_QUEUE_NAME,
};

async fn setup_test_server() -> (TestServer, WorkerHandle) {
    let registry = ActivityRegistry::new();
    register_all(&registry, TransactionLedger::new(), &TransactionLatencies::zero()).unwrap();
    let engine = Engine::open(FlowConfig::development(), registry).unwrap();
    let options = WorkerOptions::from_config(engine.config());
    let worker = WorkerPool::new(Arc::clone(&engine), options)
        .start()
        .await
        .unwrap();

    let state = AppState::new(Client::new(engine, ConnectionOptions::default()));
    state.set_worker_running(true);
    let server = TestServer::new(create_router(state)).expect("Failed to create test server");
    (server, worker)
}

#[tokio::test]
async fn test_server_info_and_worker_status() {
    let (server, worker) = setup_test_server().await;

    let response = server.get("/").await;
    response.assert_status_ok();
    let info: Value = response.json();
    assert_eq!(info["address"], "localhost:7233");

    let response = server.get("/workerstatus").await;
    response.assert_status_ok();
    let status: Value = response.json();
    assert_eq!(status["status"], "running");
    assert_eq!(status["taskQueue"], TASK_QUEUE_NAME);
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_run_workflow_records_every_iteration() {
    let (server, worker) = setup_test_server().await;

    let response = server
        .post("/runWorkflow")
        .json(&json!({
            "id": "batch-1",
            "params": { "amount": 100, "sourceAccount": "Bob", "targetAccount": "Alice" },
            "wf_type": "update-with-start",
            "iterations": 3
        }))
        .await;
    response.assert_status_ok();
    let group: Value = response.json();
    assert_eq!(group["requestId"], "batch-1");
    assert_eq!(group["iterations"], 3);

    let results = group["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0]["instanceId"],
        "local-before-update-latency-optimization-workflow-ID-batch-1-iteration-1"
    );
    for result in results {
        assert_eq!(result["status"], "Completed");
        let update_ms = result["updateLatencyMs"].as_f64().unwrap();
        assert!(update_ms <= result["finalLatencyMs"].as_f64().unwrap());
    }

    let response = server.get("/workflows/batch-1").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>(), group);
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_transaction_is_reported_not_failed() {
    let (server, worker) = setup_test_server().await;

    let response = server
        .post("/runWorkflow")
        .json(&json!({
            "id": "bad",
            "params": { "amount": 0, "sourceAccount": "Bob", "targetAccount": "Alice" }
        }))
        .await;
    response.assert_status_ok();
    let group: Value = response.json();
    assert_eq!(group["iterations"], 1);
    assert_eq!(group["results"][0]["status"], "Cancelled");
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_list_limit_and_clear() {
    let (server, worker) = setup_test_server().await;
    for id in ["first", "second"] {
        server
            .post("/runWorkflow")
            .json(&json!({
                "id": id,
                "params": { "amount": 100, "sourceAccount": "Bob", "targetAccount": "Alice" },
                "wf_type": "local"
            }))
            .await
            .assert_status_ok();
    }

    let all: Vec<Value> = server.get("/workflows").await.json();
    assert_eq!(all.len(), 2);

    let recent: Vec<Value> = server.get("/workflows").add_query_param("limit", 1).await.json();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0]["requestId"], "second");

    // An unparseable limit lists everything.
    let unlimited: Vec<Value> = server
        .get("/workflows")
        .add_query_param("limit", "lots")
        .await
        .json();
    assert_eq!(unlimited.len(), 2);

    server
        .delete("/workflows/first")
        .await
        .assert_status(StatusCode::NO_CONTENT);
    server
        .get("/workflows/first")
        .await
        .assert_status(StatusCode::NOT_FOUND);

    server
        .delete("/workflows")
        .await
        .assert_status(StatusCode::NO_CONTENT);
    let all: Vec<Value> = server.get("/workflows").await.json();
    assert!(all.is_empty());
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn test_bad_run_requests() {
    let (server, worker) = setup_test_server().await;

    let response = server
        .post("/runWorkflow")
        .json(&json!({
            "params": { "amount": 100, "sourceAccount": "Bob", "targetAccount": "Alice" },
            "wf_type": "sideways"
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "bad_request");

    let response = server
        .post("/runWorkflow")
        .json(&json!({
            "id": "none",
            "params": { "amount": 100, "sourceAccount": "Bob", "targetAccount": "Alice" },
            "iterations": 0
        }))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);

    // The same id twice collides on the instance ids.
    let body = json!({
        "id": "twice",
        "params": { "amount": 100, "sourceAccount": "Bob", "targetAccount": "Alice" }
    });
    server.post("/runWorkflow").json(&body).await.assert_status_ok();
    server
        .post("/runWorkflow")
        .json(&body)
        .await
        .assert_status(StatusCode::CONFLICT);
    worker.stop().await.unwrap();
}
