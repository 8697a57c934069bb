//! Request admission and dispatch: per-arrival decision engines and the
//! scheduler front-end that drives sandbox acquisition.

use std::collections::HashMap;
use std::time::Instant;

use edgerun_common::{ExecutionReport, Function, InvocationRequest, ServiceClass};

pub mod engine;
pub mod flux;
pub mod mem;
pub mod offload;
pub mod scheduler;
pub mod stats;

pub use engine::{build_engine, Decision, DecisionEngine, Outcome};
pub use offload::{HttpOffloader, RemoteExecutor};
pub use scheduler::Scheduler;

/// A request wrapped with the execution report populated as it moves
/// through the scheduler.
#[derive(Debug, Clone)]
pub struct ScheduledRequest {
    pub fun: Function,
    pub params: HashMap<String, serde_json::Value>,
    pub arrival: Instant,
    /// Max acceptable response time in seconds; non-positive means none.
    pub qos_max_resp_t: f64,
    pub class: ServiceClass,
    pub can_do_offloading: bool,
    pub id: String,
    pub report: ExecutionReport,
}

impl ScheduledRequest {
    /// Builds a scheduled request; the id combines the function name,
    /// a suffix of the node identifier and the arrival nanoseconds so
    /// it stays unique on a node within any observable window.
    pub fn new(fun: Function, inv: InvocationRequest, node_suffix: &str) -> Self {
        let arrival_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let id = format!("{}-{}{}", fun.name, node_suffix, arrival_ns);
        Self {
            fun,
            params: inv.params,
            arrival: Instant::now(),
            qos_max_resp_t: inv.qos_max_resp_t,
            class: ServiceClass::decode(inv.qos_class.as_deref().unwrap_or_default()),
            can_do_offloading: inv.can_do_offloading,
            id,
            report: ExecutionReport::default(),
        }
    }

    /// Deadline used by the decision engines.
    pub fn deadline(&self) -> f64 {
        if self.qos_max_resp_t > 0.0 {
            self.qos_max_resp_t
        } else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fun() -> Function {
        Function {
            name: "fib".into(),
            runtime: "python311".into(),
            custom_image: None,
            tar_function_code: None,
            cpu_demand: 0.5,
            memory_mb: 256,
        }
    }

    #[test]
    fn request_id_embeds_function_and_node_suffix() {
        let r = ScheduledRequest::new(fun(), InvocationRequest::default(), "ab42f");
        assert!(r.id.starts_with("fib-ab42f"));
        assert!(r.id.len() > "fib-ab42f".len());
    }

    #[test]
    fn missing_qos_means_no_deadline() {
        let r = ScheduledRequest::new(fun(), InvocationRequest::default(), "ab42f");
        assert_eq!(r.deadline(), f64::INFINITY);

        let inv = InvocationRequest {
            qos_max_resp_t: 0.25,
            ..Default::default()
        };
        let r = ScheduledRequest::new(fun(), inv, "ab42f");
        assert_eq!(r.deadline(), 0.25);
    }
}
