//! Proxy tests against a real in-process backend node.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

use edgerun_common::{
    Config, Coordinates, ExecutionReport, InMemoryRegistry, InvocationResponse, Registry,
    SchedAction, StatusInformation,
};
use edgerun_lb::{LbProxy, Target};

async fn spawn_app(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// A stand-in worker node answering invocations and status probes.
async fn spawn_backend() -> String {
    let app = Router::new()
        .route(
            "/invoke/:fun",
            post(|Path(fun): Path<String>| async move {
                Json(InvocationResponse {
                    success: true,
                    execution_report: ExecutionReport {
                        sched_action: SchedAction::LocalWarm,
                        response_time: 0.042,
                        output: serde_json::json!({ "fun": fun }),
                        ..Default::default()
                    },
                })
            }),
        )
        .route(
            "/status",
            get(|| async {
                Json(StatusInformation {
                    url: String::new(),
                    available_warm_containers: HashMap::from([("fib".to_string(), 2)]),
                    available_mem_mb: 2048,
                    available_cpus: 2.0,
                    drop_count: 0,
                    coordinates: Coordinates::default(),
                })
            }),
        );
    let addr = spawn_app(app).await;
    format!("http://{addr}")
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_discovers_targets_and_their_status() {
    let backend = spawn_backend().await;
    let registry = Arc::new(InMemoryRegistry::new());
    registry
        .register_node("default", "n1", &backend)
        .await
        .unwrap();

    let lb = LbProxy::new(registry, Config::default());
    lb.refresh_targets().await.unwrap();

    assert_eq!(lb.targets_len().await, 1);
    let picked = lb.select_backend("fib").await.unwrap();
    assert_eq!(picked, backend);
}

#[tokio::test(flavor = "multi_thread")]
async fn invocations_are_forwarded_and_counted() {
    let backend = spawn_backend().await;
    let lb = LbProxy::new(Arc::new(InMemoryRegistry::new()), Config::default());
    lb.update_targets(vec![Target::new(backend.clone())]).await;

    let lb_addr = spawn_app(lb.router()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{lb_addr}/invoke/fib"))
        .json(&serde_json::json!({ "Params": {}, "QoSMaxRespT": 1.0 }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: InvocationResponse = resp.json().await.unwrap();
    assert!(body.success);

    let stats = lb.stats().await;
    let counters = stats.targets.get(&backend).unwrap();
    assert_eq!(counters.completions, 1);
    assert_eq!(counters.failures, 0);
    assert!((counters.response_time_sum - 0.042).abs() < 1e-9);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_invoke_requests_pass_through_without_stats() {
    let backend = spawn_backend().await;
    let lb = LbProxy::new(Arc::new(InMemoryRegistry::new()), Config::default());
    lb.update_targets(vec![Target::new(backend.clone())]).await;

    let lb_addr = spawn_app(lb.router()).await;
    let resp = reqwest::get(format!("http://{lb_addr}/status")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let stats = lb.stats().await;
    let counters = stats.targets.get(&backend).copied().unwrap_or_default();
    assert_eq!(counters.completions + counters.failures, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_backend_counts_a_failure() {
    let lb = LbProxy::new(Arc::new(InMemoryRegistry::new()), Config::default());
    lb.update_targets(vec![Target::new("http://127.0.0.1:1")]).await;

    let lb_addr = spawn_app(lb.router()).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{lb_addr}/invoke/fib"))
        .json(&serde_json::json!({ "Params": {} }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
    let stats = lb.stats().await;
    assert_eq!(stats.targets["http://127.0.0.1:1"].failures, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_fleet_answers_service_unavailable() {
    let lb = LbProxy::new(Arc::new(InMemoryRegistry::new()), Config::default());
    let lb_addr = spawn_app(lb.router()).await;

    let resp = reqwest::get(format!("http://{lb_addr}/invoke/fib")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
}
