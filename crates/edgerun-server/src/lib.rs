//! HTTP surface of a worker node: invocation, function CRUD, async
//! polling and the status endpoint the load balancer probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use edgerun_common::{
    runtime_image, AsyncResponse, Config, EdgeError, Function, InvocationRequest,
    InvocationResponse, Registry, Result, StatusInformation, CUSTOM_RUNTIME,
};
use edgerun_scheduler::Scheduler;

/// Bound on draining in-flight requests at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<dyn Registry>,
    pub cfg: Config,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreatedResponse {
    #[serde(rename = "Created")]
    created: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeletedResponse {
    #[serde(rename = "Deleted")]
    deleted: String,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    #[serde(rename = "Name")]
    name: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/invoke/:fun", post(invoke_function))
        .route("/create", post(create_function))
        .route("/delete", post(delete_function))
        .route("/function", get(get_functions))
        .route("/poll/:req_id", get(poll_async_result))
        .route("/status", get(get_server_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_status(e: &EdgeError) -> StatusCode {
    match e {
        EdgeError::OutOfResources => StatusCode::TOO_MANY_REQUESTS,
        EdgeError::UnknownFunction(_) => StatusCode::NOT_FOUND,
        EdgeError::RegistryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn invoke_function(
    State(state): State<AppState>,
    Path(fun_name): Path<String>,
    Json(invocation): Json<InvocationRequest>,
) -> axum::response::Response {
    let fun = match state.registry.get_function(&fun_name).await {
        Ok(Some(fun)) => fun,
        Ok(None) => {
            warn!(function = %fun_name, "dropping request for unknown function");
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => return (error_status(&e), e.to_string()).into_response(),
    };

    let run_async = invocation.r#async;
    let request = state.scheduler.make_request(fun, invocation);

    if run_async {
        let req_id = request.id.clone();
        state.scheduler.submit_async(request);
        return Json(AsyncResponse { req_id }).into_response();
    }

    match state.scheduler.submit(request).await {
        Ok(report) => Json(InvocationResponse {
            success: true,
            execution_report: report,
        })
        .into_response(),
        Err(e) => {
            warn!(function = %fun_name, error = %e, "invocation failed");
            (error_status(&e), e.to_string()).into_response()
        }
    }
}

async fn create_function(
    State(state): State<AppState>,
    Json(fun): Json<Function>,
) -> axum::response::Response {
    if fun.runtime != CUSTOM_RUNTIME && runtime_image(&fun.runtime).is_none() {
        return (StatusCode::NOT_FOUND, "Invalid runtime.").into_response();
    }

    match state.registry.get_function(&fun.name).await {
        Ok(Some(_)) => {
            warn!(function = %fun.name, "dropping creation of already existing function");
            return StatusCode::CONFLICT.into_response();
        }
        Ok(None) => {}
        Err(e) => return (error_status(&e), e.to_string()).into_response(),
    }

    info!(function = %fun.name, "creating function");
    match state.registry.save_function(&fun).await {
        Ok(()) => Json(CreatedResponse { created: fun.name }).into_response(),
        Err(e) => {
            warn!(function = %fun.name, error = %e, "creation failed");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

async fn delete_function(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> axum::response::Response {
    match state.registry.get_function(&req.name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(function = %req.name, "dropping deletion of non existing function");
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(e) => return (error_status(&e), e.to_string()).into_response(),
    }

    info!(function = %req.name, "deleting function");
    if let Err(e) = state.registry.delete_function(&req.name).await {
        warn!(function = %req.name, error = %e, "deletion failed");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    // deletion cascades to the function's warm containers
    state.scheduler.node().shutdown_for(&req.name).await;
    Json(DeletedResponse { deleted: req.name }).into_response()
}

async fn get_functions(State(state): State<AppState>) -> axum::response::Response {
    match state.registry.list_functions().await {
        Ok(functions) => {
            let names: Vec<String> = functions.into_iter().map(|f| f.name).collect();
            Json(names).into_response()
        }
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

async fn poll_async_result(
    State(state): State<AppState>,
    Path(req_id): Path<String>,
) -> axum::response::Response {
    match state.registry.get_async_result(&req_id).await {
        Ok(Some(payload)) => (
            [(header::CONTENT_TYPE, "application/json")],
            payload,
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => (error_status(&e), e.to_string()).into_response(),
    }
}

async fn get_server_status(State(state): State<AppState>) -> Json<StatusInformation> {
    let node = state.scheduler.node();
    let (available_cpus, available_mem_mb) = node.available_resources().await;
    Json(StatusInformation {
        url: state.cfg.advertised_url(),
        available_warm_containers: node.warm_status().await,
        available_mem_mb,
        available_cpus,
        drop_count: node.drop_count().await,
        coordinates: state.cfg.coordinates,
    })
}

/// Serves the node API until an interrupt, then deregisters, destroys
/// every container and drains within the shutdown bound.
pub async fn serve(state: AppState) -> Result<()> {
    let cfg = state.cfg.clone();
    let registry = state.registry.clone();
    let node = state.scheduler.node().clone();
    let node_id = node.identifier().to_string();

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.api_port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| EdgeError::Internal(format!("cannot bind {addr}: {e}")))?;
    let app = build_router(state);

    registry
        .register_node(&cfg.region, &node_id, &cfg.advertised_url())
        .await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            })
            .await
    });
    info!(port = cfg.api_port, node = %node_id, "worker node listening");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| EdgeError::Internal(format!("signal handler failed: {e}")))?;
    info!("interrupt received, terminating");

    if let Err(e) = registry.deregister_node(&cfg.region, &node_id).await {
        warn!(error = %e, "deregistration failed");
    }
    node.shutdown_all().await;

    let _ = shutdown_tx.send(());
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await.is_err() {
        warn!("drain timed out, terminating anyway");
    }
    Ok(())
}
