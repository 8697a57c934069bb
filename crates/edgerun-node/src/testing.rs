//! In-memory sandbox driver for tests and local development.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use edgerun_common::{ContainerId, EdgeError, Function, Result, SandboxDriver, SandboxOutput};

/// Simulates the sandbox layer: hands out sequential container ids and
/// records destructions. Failure modes are switchable per test.
#[derive(Debug, Default)]
pub struct MockDriver {
    next_id: AtomicUsize,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    destroyed: Mutex<Vec<ContainerId>>,
    /// Simulated in-sandbox execution time, seconds.
    pub invoke_duration: f64,
}

impl MockDriver {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    pub async fn destroyed(&self) -> Vec<ContainerId> {
        self.destroyed.lock().await.clone()
    }

    pub fn created_count(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxDriver for MockDriver {
    async fn create(&self, fun: &Function) -> Result<ContainerId> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EdgeError::SandboxDriver(format!(
                "simulated creation failure for {}",
                fun.name
            )));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sbx-{n}"))
    }

    async fn destroy(&self, id: &ContainerId) -> Result<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(EdgeError::SandboxDriver(format!(
                "simulated destroy failure for {id}"
            )));
        }
        self.destroyed.lock().await.push(id.clone());
        Ok(())
    }

    async fn invoke(
        &self,
        id: &ContainerId,
        params: &HashMap<String, serde_json::Value>,
    ) -> Result<SandboxOutput> {
        Ok(SandboxOutput {
            output: serde_json::json!({ "container": id, "echo": params }),
            duration: self.invoke_duration,
        })
    }
}
