// Shared data model for the edgerun worker node and load balancer.
//
// Wire schemas keep the PascalCase field names expected by existing
// clients of the invocation API.

use std::collections::HashMap;
use std::fmt::Display;

use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod registry;

pub use config::{Config, EnginePolicy};
pub use registry::{InMemoryRegistry, Registry};

#[derive(Error, Debug)]
pub enum EdgeError {
    /// The ledger cannot reserve the requested CPU or memory.
    #[error("out of resources")]
    OutOfResources,

    /// No warm container is available; benign, triggers the cold-start path.
    #[error("no warm container is available")]
    NoWarmFound,

    #[error("sandbox driver failure: {0}")]
    SandboxDriver(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EdgeError>;

/// Coarse priority label attached to a request by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    #[default]
    Low,
    HighPerformance,
    HighAvailability,
}

impl ServiceClass {
    /// Decodes the `QoSClass` string carried by invocation requests.
    /// Unknown labels fall back to `Low`.
    pub fn decode(label: &str) -> Self {
        match label {
            "performance" => ServiceClass::HighPerformance,
            "availability" => ServiceClass::HighAvailability,
            _ => ServiceClass::Low,
        }
    }
}

pub const CUSTOM_RUNTIME: &str = "custom";

/// Maps a runtime identifier to its base container image.
pub fn runtime_image(runtime: &str) -> Option<&'static str> {
    match runtime {
        "python310" => Some("edgerun/runtime-python310:latest"),
        "python311" => Some("edgerun/runtime-python311:latest"),
        "nodejs20" => Some("edgerun/runtime-nodejs20:latest"),
        "rust" => Some("edgerun/runtime-rust:latest"),
        _ => None,
    }
}

/// A registered function. Immutable after registration; deleting it
/// destroys its warm containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    #[serde(rename = "Name")]
    pub name: String,
    /// Runtime identifier, or [`CUSTOM_RUNTIME`] to use `custom_image`.
    #[serde(rename = "Runtime")]
    pub runtime: String,
    #[serde(rename = "CustomImage", default)]
    pub custom_image: Option<String>,
    /// Handle to the code artifact unpacked into the sandbox at creation.
    #[serde(rename = "TarFunctionCode", default)]
    pub tar_function_code: Option<String>,
    /// Fractional CPU shares reserved while a container runs the function.
    #[serde(rename = "CPUDemand")]
    pub cpu_demand: f64,
    /// Memory charged at container creation, credited at destruction.
    #[serde(rename = "MemoryMB")]
    pub memory_mb: i64,
}

impl Function {
    /// Resolves the container image backing this function.
    pub fn image(&self) -> Result<String> {
        if self.runtime == CUSTOM_RUNTIME {
            self.custom_image
                .clone()
                .ok_or_else(|| EdgeError::Internal(format!("function {} has no custom image", self.name)))
        } else {
            runtime_image(&self.runtime)
                .map(str::to_owned)
                .ok_or_else(|| EdgeError::Internal(format!("invalid runtime: {}", self.runtime)))
        }
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.runtime)
    }
}

/// Body of `POST /invoke/<fun>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationRequest {
    #[serde(rename = "Params", default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Max acceptable response time in seconds; non-positive means no deadline.
    #[serde(rename = "QoSMaxRespT", default)]
    pub qos_max_resp_t: f64,
    #[serde(rename = "QoSClass", default)]
    pub qos_class: Option<String>,
    #[serde(rename = "CanDoOffloading", default)]
    pub can_do_offloading: bool,
    #[serde(rename = "Async", default)]
    pub r#async: bool,
}

/// Scheduling action finally taken for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedAction {
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "LOCAL_WARM")]
    LocalWarm,
    #[serde(rename = "LOCAL_COLD")]
    LocalCold,
    #[serde(rename = "OFFLOAD")]
    Offload,
}

/// Populated as a request progresses through the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(rename = "SchedAction")]
    pub sched_action: SchedAction,
    /// Function execution time inside the sandbox, seconds.
    #[serde(rename = "Duration")]
    pub duration: f64,
    /// Wall time from arrival to completion, seconds.
    #[serde(rename = "ResponseTime")]
    pub response_time: f64,
    /// Portion of the response time spent reaching the remote peer.
    #[serde(rename = "OffloadLatency")]
    pub offload_latency: f64,
    /// Cold-start initialization time, zero for warm starts.
    #[serde(rename = "InitTime")]
    pub init_time: f64,
    #[serde(rename = "IsWarmStart")]
    pub is_warm_start: bool,
    #[serde(rename = "Output", default)]
    pub output: serde_json::Value,
}

/// Body of a synchronous invocation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResponse {
    #[serde(rename = "Success")]
    pub success: bool,
    #[serde(rename = "ExecutionReport")]
    pub execution_report: ExecutionReport,
}

/// Body of an asynchronous invocation response; the result is stored
/// at key `async/<ReqId>` in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncResponse {
    #[serde(rename = "ReqId")]
    pub req_id: String,
}

/// Network coordinates advertised by a node, used by proximity-aware
/// balancing policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
}

impl Coordinates {
    pub fn distance(&self, other: &Coordinates) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Snapshot returned by `GET /status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusInformation {
    #[serde(rename = "Url")]
    pub url: String,
    #[serde(rename = "AvailableWarmContainers")]
    pub available_warm_containers: HashMap<String, usize>,
    #[serde(rename = "AvailableMemMB")]
    pub available_mem_mb: i64,
    #[serde(rename = "AvailableCPUs")]
    pub available_cpus: f64,
    #[serde(rename = "DropCount")]
    pub drop_count: u64,
    #[serde(rename = "Coordinates")]
    pub coordinates: Coordinates,
}

/// Opaque handle produced by the sandbox driver.
pub type ContainerId = String;

#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub output: serde_json::Value,
    /// Execution time inside the sandbox, seconds.
    pub duration: f64,
}

/// Container/VM lifecycle operations the core calls on the sandbox layer.
/// Creation and destruction may block for seconds.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Creates and starts a sandbox initialized with the function's
    /// runtime image and code artifact.
    async fn create(&self, fun: &Function) -> Result<ContainerId>;

    async fn destroy(&self, id: &ContainerId) -> Result<()>;

    /// Runs the function inside an already-acquired sandbox.
    async fn invoke(
        &self,
        id: &ContainerId,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<SandboxOutput>;
}
