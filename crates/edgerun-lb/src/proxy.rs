//! The reverse proxy itself: forwards requests verbatim to a backend
//! picked under the read lock, and folds execution reports back into
//! the per-target statistics under the write lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use edgerun_common::{
    Config, EdgeError, InvocationResponse, Registry, Result, StatusInformation,
};

use crate::mab::MabAgent;
use crate::policy::{build_policy, LbPolicy, PolicyKind, Target};
use crate::stats::{LbStats, StatsDelta};

/// Bound on draining in-flight requests at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

struct LbInner {
    targets: Vec<Target>,
    policy_kind: PolicyKind,
    policy: Box<dyn LbPolicy>,
    new_stats: LbStats,
    old_stats: LbStats,
}

pub struct LbProxy {
    inner: RwLock<LbInner>,
    // shared client, safe for concurrent use
    client: reqwest::Client,
    registry: Arc<dyn Registry>,
    cfg: Config,
    identifier: String,
}

impl LbProxy {
    pub fn new(registry: Arc<dyn Registry>, cfg: Config) -> Arc<Self> {
        let kind = PolicyKind::default();
        Arc::new(Self {
            inner: RwLock::new(LbInner {
                targets: Vec::new(),
                policy_kind: kind,
                policy: build_policy(kind, cfg.coordinates),
                new_stats: LbStats::new(kind, &[]),
                old_stats: LbStats::new(kind, &[]),
            }),
            client: reqwest::Client::new(),
            registry,
            cfg,
            identifier: format!("lb-{}", Uuid::new_v4()),
        })
    }

    pub async fn policy_kind(&self) -> PolicyKind {
        self.inner.read().await.policy_kind
    }

    pub async fn update_targets(&self, targets: Vec<Target>) {
        let mut inner = self.inner.write().await;
        inner.targets = targets;
    }

    pub async fn targets_len(&self) -> usize {
        self.inner.read().await.targets.len()
    }

    /// Copy of the accumulating statistics.
    pub async fn stats(&self) -> LbStats {
        self.inner.read().await.new_stats.clone()
    }

    /// Pulls the region's node list from the registry and probes each
    /// node's `/status`.
    pub async fn refresh_targets(&self) -> Result<()> {
        let urls = self.registry.list_nodes(&self.cfg.region).await?;
        let mut targets = Vec::with_capacity(urls.len());
        for url in urls {
            let status = self.fetch_status(&url).await;
            if status.is_none() {
                warn!(%url, "target status probe failed");
            }
            targets.push(Target { url, status });
        }
        self.update_targets(targets).await;
        Ok(())
    }

    async fn fetch_status(&self, url: &str) -> Option<StatusInformation> {
        let resp = self
            .client
            .get(format!("{}/status", url.trim_end_matches('/')))
            .send()
            .await
            .ok()?;
        if resp.status() != reqwest::StatusCode::OK {
            return None;
        }
        resp.json::<StatusInformation>().await.ok()
    }

    /// Picks a backend under the read lock.
    pub async fn select_backend(&self, fun_name: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.policy.select_target(fun_name, &inner.targets)
    }

    pub async fn install_policy(&self, kind: PolicyKind) {
        let mut inner = self.inner.write().await;
        Self::install_locked(&mut inner, kind, &self.cfg);
    }

    fn install_locked(inner: &mut LbInner, kind: PolicyKind, cfg: &Config) {
        inner.policy = build_policy(kind, cfg.coordinates);
        inner.policy_kind = kind;
        inner.new_stats.policy = kind;
        info!(policy = %kind, "lb policy installed");
    }

    /// One MAB cycle: reward the policy in effect with the stats delta,
    /// snapshot, then install the agent's next pick.
    pub async fn run_mab_cycle(&self, agent: &mut MabAgent) {
        let mut inner = self.inner.write().await;
        let delta = StatsDelta::between(&inner.new_stats, &inner.old_stats);
        agent.update(inner.new_stats.policy, &delta);
        inner.old_stats = inner.new_stats.clone();

        let next = agent.select_policy();
        if next != inner.policy_kind {
            Self::install_locked(&mut inner, next, &self.cfg);
        }
    }

    pub fn spawn_target_refresher(self: &Arc<Self>) -> JoinHandle<()> {
        let lb = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lb.cfg.target_refresh_interval());
            loop {
                interval.tick().await;
                if let Err(e) = lb.refresh_targets().await {
                    warn!(error = %e, "cannot refresh targets from registry");
                }
            }
        })
    }

    pub fn spawn_mab_agent(self: &Arc<Self>) -> JoinHandle<()> {
        let lb = self.clone();
        tokio::spawn(async move {
            let mut agent = MabAgent::new();
            let mut interval = tokio::time::interval(lb.cfg.mab_agent_interval());
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                lb.run_mab_cycle(&mut agent).await;
            }
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new().fallback(forward).with_state(self.clone())
    }

    async fn proxy(&self, req: Request) -> Response {
        let path_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());
        let fun_name = path_query
            .strip_prefix("/invoke/")
            .and_then(|rest| rest.split(['/', '?']).next())
            .unwrap_or_default()
            .to_string();
        let is_invoke = path_query.starts_with("/invoke/");

        let Some(backend) = self.select_backend(&fun_name).await else {
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "no backend available");
        };

        let method = req.method().clone();
        let headers = req.headers().clone();
        let body = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => return plain_response(StatusCode::BAD_REQUEST, "cannot read request body"),
        };

        let url = format!("{}{}", backend.trim_end_matches('/'), path_query);
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut outbound = self.client.request(method, &url);
        for (name, value) in headers.iter() {
            // hop-by-hop headers are recomputed for the outbound leg
            if name == axum::http::header::HOST || name == axum::http::header::CONTENT_LENGTH {
                continue;
            }
            outbound = outbound.header(name.as_str(), value.as_bytes());
        }

        let resp = match outbound.body(body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(%url, error = %e, "backend unreachable");
                if is_invoke {
                    self.inner.write().await.new_stats.record_failure(&backend);
                }
                return plain_response(StatusCode::BAD_GATEWAY, "backend unreachable");
            }
        };

        let status = resp.status();
        let resp_headers = resp.headers().clone();
        let bytes = resp.bytes().await.unwrap_or_default();

        if is_invoke {
            let mut inner = self.inner.write().await;
            if status == reqwest::StatusCode::OK {
                match serde_json::from_slice::<InvocationResponse>(&bytes) {
                    Ok(response) => inner
                        .new_stats
                        .record_success(&backend, response.execution_report.response_time),
                    Err(_) => inner.new_stats.record_failure(&backend),
                }
            } else {
                inner.new_stats.record_failure(&backend);
            }
        }

        let mut builder = Response::builder().status(status.as_u16());
        for (name, value) in resp_headers.iter() {
            if name == reqwest::header::TRANSFER_ENCODING {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, "proxy error"))
    }

    /// Serves the proxy until an interrupt, then deregisters and drains
    /// in-flight requests within the shutdown bound.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        self.refresh_targets().await.ok();
        self.spawn_target_refresher();
        if self.cfg.mab_agent_enabled {
            info!("mab agent enabled");
            self.spawn_mab_agent();
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.api_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EdgeError::Internal(format!("cannot bind {addr}: {e}")))?;
        let app = self.router();

        let lb_region = format!("lb/{}", self.cfg.region);
        self.registry
            .register_node(&lb_region, &self.identifier, &self.cfg.advertised_url())
            .await?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });
        info!(port = self.cfg.api_port, "lb proxy listening");

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| EdgeError::Internal(format!("signal handler failed: {e}")))?;
        info!("interrupt received, terminating");

        if let Err(e) = self
            .registry
            .deregister_node(&lb_region, &self.identifier)
            .await
        {
            warn!(error = %e, "deregistration failed");
        }

        let _ = shutdown_tx.send(());
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await.is_err() {
            warn!("drain timed out, terminating anyway");
        }
        Ok(())
    }
}

async fn forward(State(lb): State<Arc<LbProxy>>, req: Request) -> Response {
    lb.proxy(req).await
}

fn plain_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .unwrap_or_default()
}
