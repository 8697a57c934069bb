//! Scheduler front-end: turns inbound requests into scheduled requests,
//! consults the decision engine and drives sandbox acquisition.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, instrument, warn};

use edgerun_common::{
    EdgeError, ExecutionReport, Function, InvocationRequest, InvocationResponse, Registry, Result,
    SchedAction,
};
use edgerun_node::Node;

use crate::engine::{Decision, DecisionEngine, Outcome};
use crate::offload::RemoteExecutor;
use crate::ScheduledRequest;

pub struct Scheduler {
    node: Arc<Node>,
    engine: Arc<dyn DecisionEngine>,
    remote: Arc<dyn RemoteExecutor>,
    registry: Arc<dyn Registry>,
}

impl Scheduler {
    pub fn new(
        node: Arc<Node>,
        engine: Arc<dyn DecisionEngine>,
        remote: Arc<dyn RemoteExecutor>,
        registry: Arc<dyn Registry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            engine,
            remote,
            registry,
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Wraps an inbound invocation into a scheduled request bound to
    /// this node.
    pub fn make_request(&self, fun: Function, inv: InvocationRequest) -> ScheduledRequest {
        ScheduledRequest::new(fun, inv, self.node.id_suffix())
    }

    /// Runs one request to completion: decide, acquire, execute,
    /// release, report. `Decide → Acquire → Execute → Release →
    /// Completed` happens sequentially per request.
    #[instrument(skip_all, fields(req = %request.id))]
    pub async fn submit(&self, request: ScheduledRequest) -> Result<ExecutionReport> {
        match self.engine.decide(&request) {
            Decision::ExecuteLocal => self.execute_local(request).await,
            Decision::Offload => self.offload(request).await,
            Decision::Drop => self.drop_request(request).await,
        }
    }

    /// Fire-and-forget submission; the response is stored in the
    /// registry under `async/<ReqId>`.
    pub fn submit_async(self: &Arc<Self>, request: ScheduledRequest) {
        let scheduler = self.clone();
        let req_id = request.id.clone();
        tokio::spawn(async move {
            let response = match scheduler.submit(request).await {
                Ok(report) => InvocationResponse {
                    success: true,
                    execution_report: report,
                },
                Err(e) => {
                    warn!(req = %req_id, error = %e, "async invocation failed");
                    InvocationResponse {
                        success: false,
                        execution_report: ExecutionReport::default(),
                    }
                }
            };
            let payload = match serde_json::to_vec(&response) {
                Ok(p) => p,
                Err(e) => {
                    error!(req = %req_id, error = %e, "cannot encode async result");
                    return;
                }
            };
            if let Err(e) = scheduler.registry.put_async_result(&req_id, payload).await {
                error!(req = %req_id, error = %e, "cannot store async result");
            }
        });
    }

    async fn execute_local(&self, request: ScheduledRequest) -> Result<ExecutionReport> {
        match self.node.acquire_warm(&request.fun).await {
            Ok(container) => self.run_in_container(request, container, true, 0.0).await,
            // a warm miss (or missing CPU for the warm path) falls
            // through to a cold start
            Err(_) => {
                let started = Instant::now();
                match self.node.new_container(&request.fun).await {
                    Ok(container) => {
                        let init_time = started.elapsed().as_secs_f64();
                        self.run_in_container(request, container, false, init_time)
                            .await
                    }
                    Err(EdgeError::OutOfResources) => {
                        if request.can_do_offloading {
                            self.offload(request).await
                        } else {
                            self.drop_request(request).await
                        }
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn run_in_container(
        &self,
        mut request: ScheduledRequest,
        container: String,
        warm: bool,
        init_time: f64,
    ) -> Result<ExecutionReport> {
        // once a sandbox is acquired the execution runs to completion
        // and the container is released, even if the caller goes away
        let node = self.node.clone();
        let fun = request.fun.clone();
        let params = request.params.clone();
        let execution = tokio::spawn(async move {
            let invoked = node.driver().invoke(&container, &params).await;
            node.release(&container, &fun).await;
            invoked
        });
        let output = execution
            .await
            .map_err(|e| EdgeError::Internal(format!("execution task failed: {e}")))??;

        request.report.sched_action = if warm {
            SchedAction::LocalWarm
        } else {
            SchedAction::LocalCold
        };
        request.report.is_warm_start = warm;
        request.report.init_time = init_time;
        request.report.duration = output.duration;
        request.report.output = output.output;
        request.report.response_time = request.arrival.elapsed().as_secs_f64();

        self.engine.completed(&request, Outcome::Local);
        Ok(request.report)
    }

    async fn offload(&self, mut request: ScheduledRequest) -> Result<ExecutionReport> {
        let started = Instant::now();
        let response = self.remote.execute(&request).await?;
        let round_trip = started.elapsed().as_secs_f64();

        let remote = response.execution_report;
        request.report.sched_action = SchedAction::Offload;
        request.report.duration = remote.duration;
        request.report.init_time = remote.init_time;
        request.report.is_warm_start = remote.is_warm_start;
        request.report.output = remote.output;
        request.report.offload_latency = (round_trip - remote.response_time).max(0.0);
        request.report.response_time = request.arrival.elapsed().as_secs_f64();

        self.engine.completed(&request, Outcome::Offloaded);
        Ok(request.report)
    }

    async fn drop_request(&self, request: ScheduledRequest) -> Result<ExecutionReport> {
        let dropped = self.node.record_drop().await;
        warn!(req = %request.id, dropped, "dropping request");
        Err(EdgeError::OutOfResources)
    }
}
