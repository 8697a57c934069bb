//! Periodic sweep of expired warm containers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::Node;

/// Spawns the background cleaner driving [`Node::expire_idle`].
pub fn spawn_cleaner(node: Arc<Node>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            debug!("cleaner: sweeping expired warm containers");
            node.expire_idle().await;
        }
    })
}
