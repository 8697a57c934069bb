//! End-to-end tests of the node HTTP surface over a mock sandbox driver.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use edgerun_common::{
    AsyncResponse, Config, InMemoryRegistry, InvocationResponse, SchedAction, StatusInformation,
};
use edgerun_node::testing::MockDriver;
use edgerun_node::Node;
use edgerun_scheduler::{build_engine, HttpOffloader, Scheduler};
use edgerun_server::{build_router, AppState};

struct TestNode {
    base_url: String,
    client: reqwest::Client,
}

impl TestNode {
    async fn start(total_cpus: f64, total_mem_mb: i64) -> Self {
        let driver = Arc::new(MockDriver::new());
        let cfg = Config {
            total_cpus,
            total_mem_mb,
            ..Default::default()
        };
        let node = Arc::new(Node::new(driver, &cfg));
        let registry = Arc::new(InMemoryRegistry::new());
        let engine = build_engine(cfg.scheduling_policy, node.clone());
        let remote = Arc::new(HttpOffloader::new("http://127.0.0.1:1"));
        let scheduler = Scheduler::new(node, engine, remote, registry.clone());

        let app = build_router(AppState {
            scheduler,
            registry,
            cfg,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }

    async fn create_function(&self, name: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/create", self.base_url))
            .json(&serde_json::json!({
                "Name": name,
                "Runtime": "python311",
                "CPUDemand": 0.25,
                "MemoryMB": 128,
            }))
            .send()
            .await
            .unwrap()
    }

    async fn invoke(&self, name: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/invoke/{name}", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_invoke_and_observe_status() {
    let node = TestNode::start(2.0, 1024).await;

    let resp = node.create_function("fib").await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let resp = node
        .invoke("fib", serde_json::json!({ "Params": { "n": 10 } }))
        .await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body: InvocationResponse = resp.json().await.unwrap();
    assert!(body.success);
    assert_eq!(body.execution_report.sched_action, SchedAction::LocalCold);

    // the container went back to the warm pool after the run
    let status: StatusInformation = reqwest::get(format!("{}/status", node.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.available_warm_containers.get("fib"), Some(&1));
    assert_eq!(status.drop_count, 0);
    assert_eq!(status.available_mem_mb, 1024 - 128);

    // a second invocation hits the warm container
    let resp = node.invoke("fib", serde_json::json!({ "Params": {} })).await;
    let body: InvocationResponse = resp.json().await.unwrap();
    assert_eq!(body.execution_report.sched_action, SchedAction::LocalWarm);
    assert!(body.execution_report.is_warm_start);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_creation_conflicts() {
    let node = TestNode::start(2.0, 1024).await;
    assert_eq!(
        node.create_function("fib").await.status(),
        reqwest::StatusCode::OK
    );
    assert_eq!(
        node.create_function("fib").await.status(),
        reqwest::StatusCode::CONFLICT
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_runtime_is_rejected() {
    let node = TestNode::start(2.0, 1024).await;
    let resp = node
        .client
        .post(format!("{}/create", node.base_url))
        .json(&serde_json::json!({
            "Name": "weird",
            "Runtime": "cobol",
            "CPUDemand": 0.25,
            "MemoryMB": 128,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_function_is_not_found() {
    let node = TestNode::start(2.0, 1024).await;
    let resp = node.invoke("ghost", serde_json::json!({ "Params": {} })).await;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_invocation_returns_request_id_and_stores_result() {
    let node = TestNode::start(2.0, 1024).await;
    node.create_function("fib").await;

    let resp = node
        .invoke("fib", serde_json::json!({ "Params": {}, "Async": true }))
        .await;
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let ack: AsyncResponse = resp.json().await.unwrap();
    assert!(ack.req_id.starts_with("fib-"));

    let mut polled = None;
    for _ in 0..50 {
        let resp = reqwest::get(format!("{}/poll/{}", node.base_url, ack.req_id))
            .await
            .unwrap();
        if resp.status() == reqwest::StatusCode::OK {
            polled = Some(resp.json::<InvocationResponse>().await.unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let result = polled.expect("async result available");
    assert!(result.success);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_node_answers_too_many_requests() {
    let node = TestNode::start(0.0, 0).await;
    node.create_function("fib").await;

    let resp = node
        .invoke(
            "fib",
            serde_json::json!({ "Params": {}, "CanDoOffloading": false }),
        )
        .await;
    assert_eq!(resp.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);

    let status: StatusInformation = reqwest::get(format!("{}/status", node.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.drop_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_cascades_to_warm_containers() {
    let node = TestNode::start(2.0, 1024).await;
    node.create_function("fib").await;
    node.invoke("fib", serde_json::json!({ "Params": {} })).await;

    let resp = node
        .client
        .post(format!("{}/delete", node.base_url))
        .json(&serde_json::json!({ "Name": "fib" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let status: StatusInformation = reqwest::get(format!("{}/status", node.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status.available_warm_containers.get("fib"), None);
    assert_eq!(status.available_mem_mb, 1024);

    let resp = node.invoke("fib", serde_json::json!({ "Params": {} })).await;
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let resp = node
        .client
        .post(format!("{}/delete", node.base_url))
        .json(&serde_json::json!({ "Name": "fib" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}
