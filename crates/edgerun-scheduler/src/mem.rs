//! Memory-pressure decision engine (`scheduling.policy.version = mem`).

use std::sync::Arc;

use tracing::debug;

use edgerun_node::Node;

use crate::engine::{Decision, DecisionEngine, Outcome};
use crate::stats::EngineStats;
use crate::ScheduledRequest;

/// Prefers offloading once the node can no longer fit a cold start for
/// the function without evicting, and otherwise applies the QoS
/// threshold rule on observed response times.
pub struct MemEngine {
    node: Arc<Node>,
    stats: Arc<EngineStats>,
}

impl MemEngine {
    pub fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            stats: EngineStats::new(),
        }
    }
}

impl DecisionEngine for MemEngine {
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
        let (_, available_mem) = self.node.available_snapshot();
        let memory_starved = available_mem < r.fun.memory_mb;
        let local_meets = local_rt <= deadline;
        let offload_meets = snap.offload_rt.map_or(true, |rt| rt <= deadline);

        let decision = if local_meets && !memory_starved {
            Decision::ExecuteLocal
        } else if r.can_do_offloading && offload_meets {
            Decision::Offload
        } else if local_meets {
            Decision::ExecuteLocal
        } else if r.can_do_offloading {
            // every option violates the deadline; take the least bad one
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
            local_rt,
            available_mem,
            memory_starved,
            "mem engine decision"
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
