//! Arrival-flux decision engine (`scheduling.policy.version = flux`).

use std::sync::Arc;

use tracing::debug;

use edgerun_common::ServiceClass;
use edgerun_node::Node;

use crate::engine::{Decision, DecisionEngine, Outcome};
use crate::stats::EngineStats;
use crate::ScheduledRequest;

/// Arrival acceleration, per second, above which the arm is considered
/// to be surging.
const FLUX_SURGE_PER_SEC: f64 = 0.05;

/// Sheds load ahead of an arrival surge: low-priority traffic is
/// offloaded while arrivals accelerate, high-availability traffic is
/// offloaded as soon as the arm has started dropping, and
/// high-performance traffic stays local while the deadline holds.
pub struct FluxEngine {
    node: Arc<Node>,
    stats: Arc<EngineStats>,
}

impl FluxEngine {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            stats: EngineStats::new(),
        }
    }
}

impl DecisionEngine for FluxEngine {
    fn init(self: Arc<Self>) {
        self.stats.clone().spawn_pruner();
    }

    fn decide(&self, r: &ScheduledRequest) -> Decision {
        self.stats.record_arrival(&r.fun.name, r.class);
        let snap = self.stats.snapshot(&r.fun.name, r.class);

        let Some(local_rt) = snap.local_rt else {
            return Decision::ExecuteLocal;
        };

        let deadline = r.deadline();
        let (available_cpus, _) = self.node.available_snapshot();
        let surging = snap.flux > FLUX_SURGE_PER_SEC;
        let cpu_tight = available_cpus < r.fun.cpu_demand;
        let local_meets = local_rt <= deadline;
        let offload_meets = snap.offload_rt.map_or(true, |rt| rt <= deadline);

        let shed = match r.class {
            ServiceClass::Low => surging || cpu_tight,
            ServiceClass::HighAvailability => snap.drop_rate > 0.0 || cpu_tight,
            ServiceClass::HighPerformance => false,
        };

        let decision = if shed && r.can_do_offloading && offload_meets {
            Decision::Offload
        } else if local_meets && !cpu_tight {
            Decision::ExecuteLocal
        } else if r.can_do_offloading && offload_meets {
            Decision::Offload
        } else if local_meets {
            Decision::ExecuteLocal
        } else if r.can_do_offloading {
            if snap.offload_rt.unwrap_or(f64::INFINITY) < local_rt {
                Decision::Offload
            } else {
                Decision::ExecuteLocal
            }
        } else {
            self.stats.record_drop(&r.fun.name, r.class);
            Decision::Drop
        };

        debug!(
            req = %r.id,
            ?decision,
            flux = snap.flux,
            surging,
            cpu_tight,
            "flux engine decision"
        );
        decision
    }

    fn completed(&self, r: &ScheduledRequest, outcome: Outcome) {
        match outcome {
            Outcome::Local => {
                self.stats
                    .record_local(&r.fun.name, r.class, r.report.response_time)
            }
            Outcome::Offloaded => {
                self.stats
                    .record_offload(&r.fun.name, r.class, r.report.response_time)
            }
        }
    }
}
