//! Execution on a remote cloud peer.

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use edgerun_common::{EdgeError, InvocationRequest, InvocationResponse, Result};

use crate::ScheduledRequest;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, request: &ScheduledRequest) -> Result<InvocationResponse>;
}

/// Forwards an invocation to a peer node's HTTP surface. The shared
/// client is safe for concurrent use.
pub struct HttpOffloader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpOffloader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for HttpOffloader {
    async fn execute(&self, request: &ScheduledRequest) -> Result<InvocationResponse> {
        let url = format!("{}/invoke/{}", self.base_url, request.fun.name);
        let body = InvocationRequest {
            params: request.params.clone(),
            qos_max_resp_t: request.qos_max_resp_t,
            qos_class: None,
            // the peer must not bounce the request further
            can_do_offloading: false,
            r#async: false,
        };

        debug!(req = %request.id, %url, "offloading request");
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EdgeError::Internal(format!("offload to {url} failed: {e}")))?;

        match resp.status() {
            StatusCode::OK => resp
                .json::<InvocationResponse>()
                .await
                .map_err(|e| EdgeError::Internal(format!("bad offload response: {e}"))),
            StatusCode::NOT_FOUND => Err(EdgeError::UnknownFunction(request.fun.name.clone())),
            StatusCode::TOO_MANY_REQUESTS => Err(EdgeError::OutOfResources),
            status => Err(EdgeError::Internal(format!(
                "offload peer answered {status}"
            ))),
        }
    }
}
