//! Decision-engine capability and tagged construction.

use std::sync::Arc;

use tracing::info;

use edgerun_common::EnginePolicy;
use edgerun_node::Node;

use crate::flux::FluxEngine;
use crate::mem::MemEngine;
use crate::ScheduledRequest;

/// Per-arrival scheduling choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ExecuteLocal,
    Offload,
    Drop,
}

/// Where a completed request actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Local,
    Offloaded,
}

/// The engine never fails: a missing-statistics case decides
/// `ExecuteLocal` and lets the pool's own errors drive what happens
/// next. `decide` may read the resource ledger but must not mutate it,
/// returns in O(1), and never chooses `Offload` for a request whose
/// offloading bit is clear.
pub trait DecisionEngine: Send + Sync {
    /// Starts the background statistics bookkeeping.
    fn init(self: Arc<Self>);

    fn decide(&self, request: &ScheduledRequest) -> Decision;

    fn completed(&self, request: &ScheduledRequest, outcome: Outcome);
}

/// Builds and initializes the engine variant selected by
/// `scheduling.policy.version`.
pub fn build_engine(policy: EnginePolicy, node: Arc<Node>) -> Arc<dyn DecisionEngine> {
    info!(?policy, "scheduling policy version");
    let engine: Arc<dyn DecisionEngine> = match policy {
        EnginePolicy::Mem => Arc::new(MemEngine::new(node)),
        EnginePolicy::Flux => Arc::new(FluxEngine::new(node)),
    };
    engine.clone().init();
    engine
}
