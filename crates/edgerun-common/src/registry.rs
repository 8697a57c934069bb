//! Registry seam over the external watchable K/V store.
//!
//! Key layout follows the deployment contract: node URLs under
//! `node/<region>/<id>`, function metadata under `fn/<name>`, async
//! invocation results under `async/<reqId>`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{EdgeError, Function, Result};

#[async_trait]
pub trait Registry: Send + Sync {
    async fn register_node(&self, region: &str, node_id: &str, url: &str) -> Result<()>;
    async fn deregister_node(&self, region: &str, node_id: &str) -> Result<()>;
    /// URLs of the nodes currently registered in a region.
    async fn list_nodes(&self, region: &str) -> Result<Vec<String>>;

    async fn save_function(&self, fun: &Function) -> Result<()>;
    async fn get_function(&self, name: &str) -> Result<Option<Function>>;
    async fn delete_function(&self, name: &str) -> Result<()>;
    async fn list_functions(&self) -> Result<Vec<Function>>;

    async fn put_async_result(&self, req_id: &str, payload: Vec<u8>) -> Result<()>;
    async fn get_async_result(&self, req_id: &str) -> Result<Option<Vec<u8>>>;
}

/// Single-process registry used for tests and standalone deployments.
/// Production deployments point the same trait at the cluster K/V store.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    nodes: RwLock<HashMap<String, String>>,
    functions: RwLock<HashMap<String, Function>>,
    async_results: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    fn node_key(region: &str, node_id: &str) -> String {
        format!("node/{region}/{node_id}")
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register_node(&self, region: &str, node_id: &str, url: &str) -> Result<()> {
        self.nodes
            .write()
            .await
            .insert(Self::node_key(region, node_id), url.to_string());
        Ok(())
    }

    async fn deregister_node(&self, region: &str, node_id: &str) -> Result<()> {
        self.nodes.write().await.remove(&Self::node_key(region, node_id));
        Ok(())
    }

    async fn list_nodes(&self, region: &str) -> Result<Vec<String>> {
        let prefix = format!("node/{region}/");
        let nodes = self.nodes.read().await;
        let mut urls: Vec<String> = nodes
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| v.clone())
            .collect();
        urls.sort();
        Ok(urls)
    }

    async fn save_function(&self, fun: &Function) -> Result<()> {
        self.functions
            .write()
            .await
            .insert(fun.name.clone(), fun.clone());
        Ok(())
    }

    async fn get_function(&self, name: &str) -> Result<Option<Function>> {
        Ok(self.functions.read().await.get(name).cloned())
    }

    async fn delete_function(&self, name: &str) -> Result<()> {
        self.functions
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EdgeError::UnknownFunction(name.to_string()))
    }

    async fn list_functions(&self) -> Result<Vec<Function>> {
        let mut funs: Vec<Function> = self.functions.read().await.values().cloned().collect();
        funs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(funs)
    }

    async fn put_async_result(&self, req_id: &str, payload: Vec<u8>) -> Result<()> {
        self.async_results
            .write()
            .await
            .insert(format!("async/{req_id}"), payload);
        Ok(())
    }

    async fn get_async_result(&self, req_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .async_results
            .read()
            .await
            .get(&format!("async/{req_id}"))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_function(name: &str) -> Function {
        Function {
            name: name.to_string(),
            runtime: "python311".to_string(),
            custom_image: None,
            tar_function_code: None,
            cpu_demand: 0.5,
            memory_mb: 256,
        }
    }

    #[tokio::test]
    async fn node_listing_is_scoped_by_region() {
        let reg = InMemoryRegistry::new();
        reg.register_node("rome", "n1", "http://10.0.0.1:1323").await.unwrap();
        reg.register_node("rome", "n2", "http://10.0.0.2:1323").await.unwrap();
        reg.register_node("oslo", "n3", "http://10.1.0.1:1323").await.unwrap();

        let rome = reg.list_nodes("rome").await.unwrap();
        assert_eq!(rome.len(), 2);
        assert!(!rome.contains(&"http://10.1.0.1:1323".to_string()));

        reg.deregister_node("rome", "n1").await.unwrap();
        assert_eq!(reg.list_nodes("rome").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn function_lifecycle() {
        let reg = InMemoryRegistry::new();
        assert!(reg.get_function("f").await.unwrap().is_none());

        reg.save_function(&sample_function("f")).await.unwrap();
        assert!(reg.get_function("f").await.unwrap().is_some());

        reg.delete_function("f").await.unwrap();
        assert!(matches!(
            reg.delete_function("f").await,
            Err(EdgeError::UnknownFunction(_))
        ));
    }

    #[tokio::test]
    async fn async_results_round_trip() {
        let reg = InMemoryRegistry::new();
        reg.put_async_result("fib-ab123", b"{\"Success\":true}".to_vec())
            .await
            .unwrap();
        let got = reg.get_async_result("fib-ab123").await.unwrap().unwrap();
        assert_eq!(got, b"{\"Success\":true}");
        assert!(reg.get_async_result("missing").await.unwrap().is_none());
    }
}
